//! In-memory metadata repository for integration tests.
//!
//! Mirrors the PostgreSQL repository's semantics: latest-committed-version
//! reads, conditional migration writes, quadruple-ordered paging, and
//! structural JSONB containment (evaluated directly rather than through the
//! leaf intersection, which the two are equivalent to by construction).

use async_trait::async_trait;
use futures::stream;
use keyhole_core::codec::split_to_leaves;
use keyhole_core::location::{
    JsonMap, ObjectInfo, ObjectLocation, ObjectMetadata, STATUS_COMMITTED_UNVERSIONED,
    STATUS_PENDING, is_delete_marker, prefix_limit,
};
use keyhole_metadata::{MAX_MATCH_LEAVES, MetadataRepo, ObjectStream, RepoError, RepoResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
struct StoredObject {
    status: i16,
    metadata: ObjectMetadata,
    queued_at: Option<OffsetDateTime>,
}

/// In-memory `MetadataRepo`.
#[derive(Default)]
pub struct MemoryRepo {
    objects: Mutex<BTreeMap<ObjectLocation, StoredObject>>,
}

#[allow(dead_code)]
impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest(
        objects: &BTreeMap<ObjectLocation, StoredObject>,
        loc: &ObjectLocation,
    ) -> Option<(ObjectLocation, StoredObject)> {
        let lower = ObjectLocation {
            version: i64::MIN,
            ..loc.clone()
        };
        let upper = ObjectLocation {
            version: i64::MAX,
            ..loc.clone()
        };
        objects
            .range(lower..=upper)
            .filter(|(_, stored)| stored.status != STATUS_PENDING)
            .next_back()
            .map(|(location, stored)| (location.clone(), stored.clone()))
    }

    fn info(location: ObjectLocation, stored: StoredObject) -> ObjectInfo {
        ObjectInfo {
            location,
            status: stored.status,
            metadata: stored.metadata,
            queued_at: stored.queued_at,
        }
    }

    /// Simulate an external (legacy-channel) writer replacing the encrypted
    /// metadata of an existing object: the cleartext column goes stale and
    /// the object is queued.
    pub fn write_external(&self, bucket: &str, encrypted_key: &str, sealed: &ObjectMetadata) {
        let mut objects = self.objects.lock().unwrap();
        let loc = objects
            .keys()
            .find(|l| l.bucket == bucket && l.object_key == encrypted_key)
            .cloned()
            .expect("external write targets an existing object");

        let stored = objects.get_mut(&loc).unwrap();
        stored.metadata.encrypted_nonce = sealed.encrypted_nonce.clone();
        stored.metadata.encrypted_blob = sealed.encrypted_blob.clone();
        stored.metadata.encrypted_key = sealed.encrypted_key.clone();
        stored.queued_at = Some(OffsetDateTime::now_utc());
    }

    /// Insert a fresh object row as an external writer would create it:
    /// encrypted metadata only, queued for migration.
    pub fn insert_external(&self, location: ObjectLocation, sealed: &ObjectMetadata) {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            ObjectLocation {
                version: 1,
                ..location
            },
            StoredObject {
                status: STATUS_COMMITTED_UNVERSIONED,
                metadata: ObjectMetadata {
                    encrypted_nonce: sealed.encrypted_nonce.clone(),
                    encrypted_blob: sealed.encrypted_blob.clone(),
                    encrypted_key: sealed.encrypted_key.clone(),
                    clear: None,
                },
                queued_at: Some(OffsetDateTime::now_utc()),
            },
        );
    }

    /// Whether the object at the encrypted key is still queued.
    pub fn queued(&self, bucket: &str, encrypted_key: &str) -> bool {
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .find(|(l, _)| l.bucket == bucket && l.object_key == encrypted_key)
            .is_some_and(|(_, stored)| stored.queued_at.is_some())
    }

    /// The stored cleartext metadata at the encrypted key.
    pub fn stored_clear(&self, bucket: &str, encrypted_key: &str) -> Option<JsonMap> {
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .find(|(l, _)| l.bucket == bucket && l.object_key == encrypted_key)
            .and_then(|(_, stored)| stored.metadata.clear.clone())
    }
}

/// Structural JSONB containment: does `left` contain `right`?
#[allow(dead_code)]
pub fn json_contains(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => r
            .iter()
            .all(|(k, rv)| l.get(k).is_some_and(|lv| json_contains(lv, rv))),
        (Value::Array(l), Value::Array(r)) => r
            .iter()
            .all(|rv| l.iter().any(|lv| json_contains(lv, rv))),
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        (l, r) => l == r,
    }
}

#[async_trait]
impl MetadataRepo for MemoryRepo {
    async fn get_metadata(&self, loc: &ObjectLocation) -> RepoResult<ObjectInfo> {
        let objects = self.objects.lock().unwrap();
        let (location, stored) = Self::latest(&objects, loc).ok_or(RepoError::NotFound)?;
        if is_delete_marker(stored.status) {
            return Err(RepoError::NotFound);
        }
        Ok(Self::info(location, stored))
    }

    async fn update_metadata(&self, loc: &ObjectLocation, meta: &ObjectMetadata) -> RepoResult<()> {
        let mut objects = self.objects.lock().unwrap();

        // The PostgreSQL repository updates the latest committed version.
        // Tests have no upload path, so a missing object is created instead.
        let location = match Self::latest(&objects, loc) {
            Some((location, _)) => location,
            None => ObjectLocation {
                version: 1,
                ..loc.clone()
            },
        };

        objects.insert(
            location,
            StoredObject {
                status: STATUS_COMMITTED_UNVERSIONED,
                metadata: meta.clone(),
                queued_at: None,
            },
        );
        Ok(())
    }

    async fn query_metadata(
        &self,
        loc: &ObjectLocation,
        match_query: &JsonMap,
        start_after: Option<&ObjectLocation>,
        batch_size: usize,
    ) -> RepoResult<Vec<ObjectInfo>> {
        let leaves = split_to_leaves(&Value::Object(match_query.clone()));
        if leaves.len() > MAX_MATCH_LEAVES {
            return Err(RepoError::BadRequest(
                "too many values in metadata query".to_string(),
            ));
        }

        let upper = if loc.object_key.is_empty() {
            None
        } else {
            prefix_limit(&loc.object_key)
        };

        let objects = self.objects.lock().unwrap();
        let mut result = Vec::new();
        for (location, stored) in objects.iter() {
            if location.project_id != loc.project_id
                || location.bucket != loc.bucket
                || stored.status == STATUS_PENDING
            {
                continue;
            }

            let in_range = match start_after {
                Some(after) => location > after,
                None => {
                    location
                        >= &ObjectLocation {
                            version: 0,
                            ..loc.clone()
                        }
                }
            };
            if !in_range {
                continue;
            }
            if let Some(limit) = &upper
                && location.object_key.as_bytes() >= limit.as_slice()
            {
                continue;
            }

            if !leaves.is_empty() {
                let Some(clear) = &stored.metadata.clear else {
                    continue;
                };
                let clear = Value::Object(clear.clone());
                if !leaves.iter().all(|leaf| json_contains(&clear, leaf)) {
                    continue;
                }
            }

            result.push(Self::info(location.clone(), stored.clone()));
            if result.len() >= batch_size {
                break;
            }
        }

        Ok(result)
    }

    async fn migrate_metadata(&self, obj: &ObjectInfo) -> RepoResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get_mut(&obj.location).ok_or(RepoError::NotFound)?;
        if stored.queued_at.is_none() || stored.queued_at != obj.queued_at {
            return Err(RepoError::NotFound);
        }

        stored.metadata = obj.metadata.clone();
        stored.queued_at = None;
        Ok(())
    }

    fn objects_for_migration(
        &self,
        project_id: Uuid,
        start_time: Option<OffsetDateTime>,
    ) -> ObjectStream<'_> {
        let mut queued: Vec<ObjectInfo> = {
            let objects = self.objects.lock().unwrap();
            objects
                .iter()
                .filter(|(location, stored)| {
                    location.project_id == project_id
                        && stored
                            .queued_at
                            .is_some_and(|at| start_time.is_none_or(|start| at >= start))
                })
                .map(|(location, stored)| Self::info(location.clone(), stored.clone()))
                .collect()
        };
        queued.sort_by_key(|obj| obj.queued_at);

        Box::pin(stream::iter(queued.into_iter().map(Ok)))
    }
}
