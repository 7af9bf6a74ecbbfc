//! Object identity and metadata model.
//!
//! Objects are addressed by the quadruple `(project_id, bucket, object_key,
//! version)`. The quadruple is totally ordered lexicographically and serves
//! as the paging key for all queries.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// A parsed cleartext metadata object: string keys, arbitrary JSON values.
pub type JsonMap = serde_json::Map<String, Value>;

/// Object status: upload started but not committed.
pub const STATUS_PENDING: i16 = 1;
/// Object status: committed, unversioned.
pub const STATUS_COMMITTED_UNVERSIONED: i16 = 3;
/// Object status: committed, versioned.
pub const STATUS_COMMITTED_VERSIONED: i16 = 4;
/// Object status: delete marker, unversioned.
pub const STATUS_DELETE_MARKER_UNVERSIONED: i16 = 5;
/// Object status: delete marker, versioned.
pub const STATUS_DELETE_MARKER_VERSIONED: i16 = 6;

/// Returns true if the status byte denotes a delete marker.
pub fn is_delete_marker(status: i16) -> bool {
    status == STATUS_DELETE_MARKER_UNVERSIONED || status == STATUS_DELETE_MARKER_VERSIONED
}

/// The location of an object.
///
/// The derived ordering is the lexicographic ordering on the quadruple, in
/// field declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectLocation {
    pub project_id: Uuid,
    pub bucket: String,
    pub object_key: String,
    /// Optional; zero on locations that address "the latest version".
    pub version: i64,
}

impl ObjectLocation {
    /// Create a versionless location (version 0).
    pub fn new(project_id: Uuid, bucket: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            project_id,
            bucket: bucket.into(),
            object_key: object_key.into(),
            version: 0,
        }
    }
}

/// Clear and encrypted metadata for an object, together.
///
/// The three encrypted fields are persisted as-is and form the legacy
/// end-to-end encrypted channel: `encrypted_key` is the wrapped content key,
/// `encrypted_nonce` the nonce it was wrapped under, and `encrypted_blob` the
/// sealed metadata itself. When `clear` is present after a server-side write,
/// the encrypted fields are a valid sealing of it; when `clear` is absent
/// while the encrypted fields are non-empty, the object awaits migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub encrypted_nonce: Vec<u8>,
    pub encrypted_blob: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub clear: Option<JsonMap>,
}

/// The subset of object fields used by the search service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectInfo {
    pub location: ObjectLocation,
    pub status: i16,
    pub metadata: ObjectMetadata,
    /// Non-null iff the object sits in the change queue.
    pub queued_at: Option<OffsetDateTime>,
}

/// Compute the exclusive upper bound of a key-prefix range: the prefix with
/// its last non-`0xff` byte incremented and everything after it truncated.
///
/// Returns `None` when every byte is `0xff`, in which case the range is
/// unbounded above.
pub fn prefix_limit(prefix: &str) -> Option<Vec<u8>> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(&last) = bytes.last() {
        if last < 0xff {
            let end = bytes.len() - 1;
            bytes[end] = last + 1;
            return Some(bytes);
        }
        bytes.pop();
    }
    None
}

/// Strip leading and trailing slashes from a key prefix.
pub fn normalize_key_prefix(prefix: &str) -> &str {
    prefix.trim_start_matches('/').trim_end_matches('/')
}
