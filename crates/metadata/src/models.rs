//! Database models mapping to the objects schema.

use crate::error::{RepoError, RepoResult};
use keyhole_core::location::{ObjectInfo, ObjectLocation, ObjectMetadata};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// The subset of object columns the search service reads.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub project_id: Uuid,
    pub bucket_name: Vec<u8>,
    pub object_key: Vec<u8>,
    pub version: i64,
    pub status: i16,
    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub clear_metadata: Option<serde_json::Value>,
    pub metasearch_queued_at: Option<OffsetDateTime>,
}

impl ObjectRow {
    /// Convert the row into the domain representation.
    ///
    /// A non-object `clear_metadata` value is logged and dropped: the
    /// migrator only needs the encrypted channel to repair it.
    pub fn into_object_info(self) -> RepoResult<ObjectInfo> {
        let bucket = String::from_utf8(self.bucket_name)
            .map_err(|_| RepoError::Internal("bucket name is not valid UTF-8".to_string()))?;
        let object_key = String::from_utf8(self.object_key)
            .map_err(|_| RepoError::Internal("object key is not valid UTF-8".to_string()))?;

        let clear = match self.clear_metadata {
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => {
                tracing::warn!(
                    project_id = %self.project_id,
                    value_type = other_type(&other),
                    "cannot decode clear metadata, ignoring"
                );
                None
            }
            None => None,
        };

        Ok(ObjectInfo {
            location: ObjectLocation {
                project_id: self.project_id,
                bucket,
                object_key,
                version: self.version,
            },
            status: self.status,
            metadata: ObjectMetadata {
                encrypted_nonce: self.encrypted_metadata_nonce.unwrap_or_default(),
                encrypted_blob: self.encrypted_metadata.unwrap_or_default(),
                encrypted_key: self.encrypted_metadata_encrypted_key.unwrap_or_default(),
                clear,
            },
            queued_at: self.metasearch_queued_at,
        })
    }
}

fn other_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> ObjectRow {
        ObjectRow {
            project_id: Uuid::new_v4(),
            bucket_name: b"bucket".to_vec(),
            object_key: b"key".to_vec(),
            version: 1,
            status: 3,
            encrypted_metadata_nonce: None,
            encrypted_metadata: Some(b"blob".to_vec()),
            encrypted_metadata_encrypted_key: None,
            clear_metadata: Some(json!({"foo": "bar"})),
            metasearch_queued_at: None,
        }
    }

    #[test]
    fn row_converts_to_object_info() {
        let info = row().into_object_info().unwrap();
        assert_eq!(info.location.bucket, "bucket");
        assert_eq!(info.location.object_key, "key");
        assert_eq!(info.metadata.encrypted_blob, b"blob");
        assert_eq!(
            info.metadata.clear.unwrap().get("foo"),
            Some(&json!("bar"))
        );
    }

    #[test]
    fn non_object_clear_metadata_is_dropped() {
        let mut bad = row();
        bad.clear_metadata = Some(json!([1, 2, 3]));
        let info = bad.into_object_info().unwrap();
        assert!(info.metadata.clear.is_none());
    }

    #[test]
    fn invalid_utf8_key_is_an_error() {
        let mut bad = row();
        bad.object_key = vec![0xff, 0xfe];
        assert!(bad.into_object_info().is_err());
    }
}
