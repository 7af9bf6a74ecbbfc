//! The metadata repository contract.

use crate::error::RepoResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use keyhole_core::location::{JsonMap, ObjectInfo, ObjectLocation, ObjectMetadata};
use time::OffsetDateTime;
use uuid::Uuid;

/// Ordered stream of objects awaiting migration. Dropping the stream stops
/// the traversal.
pub type ObjectStream<'a> = BoxStream<'a, RepoResult<ObjectInfo>>;

/// Operations on per-object metadata in the primary index.
#[async_trait]
pub trait MetadataRepo: Send + Sync {
    /// Get metadata for the latest committed version of an object.
    async fn get_metadata(&self, loc: &ObjectLocation) -> RepoResult<ObjectInfo>;

    /// Set metadata for the latest committed version of an object.
    async fn update_metadata(&self, loc: &ObjectLocation, meta: &ObjectMetadata) -> RepoResult<()>;

    /// Delete metadata for an object. Modelled as an update with empty
    /// metadata; the object row itself survives.
    async fn delete_metadata(&self, loc: &ObjectLocation) -> RepoResult<()> {
        self.update_metadata(loc, &ObjectMetadata::default()).await
    }

    /// Query metadata in a bucket, optionally under a key prefix (pass it in
    /// `loc.object_key`, with a trailing `/`). Returns at most `batch_size`
    /// objects in ascending quadruple order, strictly after `start_after`
    /// when given.
    async fn query_metadata(
        &self,
        loc: &ObjectLocation,
        match_query: &JsonMap,
        start_after: Option<&ObjectLocation>,
        batch_size: usize,
    ) -> RepoResult<Vec<ObjectInfo>>;

    /// Write back migrated metadata and dequeue the object, atomically and
    /// conditional on `queued_at` being unchanged. Zero affected rows map to
    /// [`RepoError::NotFound`](crate::RepoError::NotFound): the object was
    /// concurrently migrated, deleted, or re-queued.
    async fn migrate_metadata(&self, obj: &ObjectInfo) -> RepoResult<()>;

    /// All queued objects of a project, ordered by `queued_at`, starting at
    /// the optional watermark.
    fn objects_for_migration(
        &self,
        project_id: Uuid,
        start_time: Option<OffsetDateTime>,
    ) -> ObjectStream<'_>;
}
