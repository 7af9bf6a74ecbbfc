//! Per-project capability repository.
//!
//! Every authenticated request contributes its decryption capability. The
//! repository keeps the set minimal on the subset lattice, tracks per-entry
//! decryption success online, and evicts cold entries when the set outgrows
//! its bound. Insertion order is preserved and is the fanout order.

use crate::encryptor::{CapabilityOrdering, Encryptor};
use crate::error::{AccessError, AccessResult};
use keyhole_core::location::{ObjectInfo, ObjectMetadata};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default bound on capabilities retained per project.
pub const DEFAULT_MAX_CAPABILITIES: usize = 100;

struct Capability {
    encryptor: Arc<dyn Encryptor>,
    success: AtomicU64,
    total: AtomicU64,
}

impl Capability {
    fn new(encryptor: Arc<dyn Encryptor>) -> Self {
        Self {
            encryptor,
            success: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }
}

/// A bounded, deduplicated set of decryption capabilities for one project.
///
/// Invariant: no entry is a subset of another. Counter updates are atomic so
/// concurrent decryption fanout never takes the mutex.
#[derive(Default)]
pub struct CapabilityRepository {
    entries: Mutex<Vec<Arc<Capability>>>,
}

impl CapabilityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability. Returns true iff the set now covers strictly more
    /// than before: a subset or equivalent of an existing entry is dropped,
    /// the first strictly-dominated entry is replaced in place, anything
    /// else is appended.
    pub fn add(&self, encryptor: Arc<dyn Encryptor>) -> bool {
        let mut entries = self.entries.lock().expect("capability lock poisoned");

        for (i, entry) in entries.iter().enumerate() {
            match encryptor.compare(entry.encryptor.as_ref()) {
                CapabilityOrdering::Identical | CapabilityOrdering::Subset => return false,
                CapabilityOrdering::Superset => {
                    entries[i] = Arc::new(Capability::new(encryptor));
                    return true;
                }
                CapabilityOrdering::Disjoint => {}
            }
        }

        entries.push(Arc::new(Capability::new(encryptor)));
        true
    }

    /// Try each capability in insertion order until one decrypts both the
    /// object's path and its metadata blob. Returns the cleartext key and
    /// the opened metadata.
    pub fn decrypt_object(&self, obj: &ObjectInfo) -> AccessResult<(String, ObjectMetadata)> {
        let snapshot: Vec<Arc<Capability>> = self
            .entries
            .lock()
            .expect("capability lock poisoned")
            .clone();

        for entry in snapshot {
            entry.total.fetch_add(1, Ordering::Relaxed);

            let clear_key = match entry
                .encryptor
                .decrypt_path(&obj.location.bucket, &obj.location.object_key)
            {
                Ok(key) => key,
                Err(_) => continue,
            };

            let mut meta = obj.metadata.clone();
            if entry
                .encryptor
                .decrypt_metadata(&obj.location.bucket, &clear_key, &mut meta)
                .is_err()
            {
                continue;
            }

            entry.success.fetch_add(1, Ordering::Relaxed);
            return Ok((clear_key, meta));
        }

        Err(AccessError::NoCapability)
    }

    /// Evict down to `max` entries, keeping the most successful ones.
    /// Returns whether anything was evicted. The sort is stable, so ties
    /// keep insertion order.
    pub fn prune(&self, max: usize) -> bool {
        let mut entries = self.entries.lock().expect("capability lock poisoned");
        if entries.len() <= max {
            return false;
        }

        entries.sort_by_key(|e| std::cmp::Reverse(e.success.load(Ordering::Relaxed)));
        entries.truncate(max);

        tracing::debug!(retained = entries.len(), "pruned capability repository");
        true
    }

    /// Number of capabilities currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("capability lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
