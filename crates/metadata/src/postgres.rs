//! PostgreSQL-backed metadata repository.

use crate::error::{RepoError, RepoResult};
use crate::models::ObjectRow;
use crate::planner::{OBJECT_COLUMNS, build_search_plan};
use crate::repo::{MetadataRepo, ObjectStream};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use keyhole_core::location::{
    JsonMap, ObjectInfo, ObjectLocation, ObjectMetadata, STATUS_COMMITTED_UNVERSIONED,
    STATUS_COMMITTED_VERSIONED, STATUS_PENDING, is_delete_marker,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// PostgreSQL-backed metadata repository.
pub struct PostgresRepo {
    pool: Pool<Postgres>,
}

impl PostgresRepo {
    /// Connect to PostgreSQL from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> RepoResult<Self> {
        let mut opts = PgConnectOptions::from_str(url)?;

        // Prevent hung queries from pinning pool connections.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {timeout_ms}ms");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Verify database connectivity.
    pub async fn health_check(&self) -> RepoResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn clear_metadata_value(meta: &ObjectMetadata) -> Option<serde_json::Value> {
        meta.clear
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()))
    }

    fn optional_bytes(bytes: &[u8]) -> Option<Vec<u8>> {
        if bytes.is_empty() {
            None
        } else {
            Some(bytes.to_vec())
        }
    }
}

#[async_trait]
impl MetadataRepo for PostgresRepo {
    async fn get_metadata(&self, loc: &ObjectLocation) -> RepoResult<ObjectInfo> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 \
               AND status <> $4 \
             ORDER BY version DESC LIMIT 1"
        );

        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(loc.project_id)
            .bind(loc.bucket.as_bytes())
            .bind(loc.object_key.as_bytes())
            .bind(STATUS_PENDING)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(RepoError::NotFound);
        };
        if is_delete_marker(row.status) {
            return Err(RepoError::NotFound);
        }

        row.into_object_info()
    }

    async fn update_metadata(&self, loc: &ObjectLocation, meta: &ObjectMetadata) -> RepoResult<()> {
        let sql = format!(
            "UPDATE objects SET \
                 encrypted_metadata_nonce = $4, encrypted_metadata = $5, \
                 encrypted_metadata_encrypted_key = $6, clear_metadata = $7, \
                 metasearch_queued_at = NULL \
             WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 \
               AND status IN ({STATUS_COMMITTED_UNVERSIONED}, {STATUS_COMMITTED_VERSIONED}) \
               AND version IN ( \
                   SELECT version FROM objects \
                   WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 \
                     AND status <> {STATUS_PENDING} \
                     AND (expires_at IS NULL OR expires_at > now()) \
                   ORDER BY version DESC LIMIT 1 \
               )"
        );

        let result = sqlx::query(&sql)
            .bind(loc.project_id)
            .bind(loc.bucket.as_bytes())
            .bind(loc.object_key.as_bytes())
            .bind(Self::optional_bytes(&meta.encrypted_nonce))
            .bind(Self::optional_bytes(&meta.encrypted_blob))
            .bind(Self::optional_bytes(&meta.encrypted_key))
            .bind(Self::clear_metadata_value(meta))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn query_metadata(
        &self,
        loc: &ObjectLocation,
        match_query: &JsonMap,
        start_after: Option<&ObjectLocation>,
        batch_size: usize,
    ) -> RepoResult<Vec<ObjectInfo>> {
        let plan = build_search_plan(loc, match_query, start_after, batch_size)?;

        tracing::debug!(
            project_id = %loc.project_id,
            bucket = %loc.bucket,
            key_prefix = %loc.object_key,
            leaves = plan.leaves.len(),
            batch_size,
            "querying objects by clear metadata"
        );

        let mut query = sqlx::query_as::<_, ObjectRow>(&plan.sql);
        for leaf in &plan.leaves {
            query = query.bind(leaf);
        }
        query = query
            .bind(loc.project_id)
            .bind(loc.bucket.as_bytes())
            .bind(STATUS_PENDING);

        match (&plan.first_page_key, &plan.start_after) {
            (Some(prefix), _) => {
                query = query
                    .bind(loc.project_id)
                    .bind(loc.bucket.as_bytes())
                    .bind(prefix.as_bytes().to_vec())
                    .bind(0_i64);
            }
            (None, Some(after)) => {
                query = query
                    .bind(after.project_id)
                    .bind(after.bucket.as_bytes().to_vec())
                    .bind(after.object_key.as_bytes().to_vec())
                    .bind(after.version);
            }
            (None, None) => unreachable!("plan always has a lower bound"),
        }

        if let Some(limit) = &plan.prefix_limit {
            query = query
                .bind(loc.project_id)
                .bind(loc.bucket.as_bytes())
                .bind(limit.clone())
                .bind(0_i64);
        }
        query = query.bind(plan.batch_size);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(ObjectRow::into_object_info).collect()
    }

    async fn migrate_metadata(&self, obj: &ObjectInfo) -> RepoResult<()> {
        let result = sqlx::query(
            "UPDATE objects SET \
                 encrypted_metadata_nonce = $6, encrypted_metadata = $7, \
                 encrypted_metadata_encrypted_key = $8, clear_metadata = $9, \
                 metasearch_queued_at = NULL \
             WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 \
               AND version = $4 AND metasearch_queued_at = $5",
        )
        .bind(obj.location.project_id)
        .bind(obj.location.bucket.as_bytes())
        .bind(obj.location.object_key.as_bytes())
        .bind(obj.location.version)
        .bind(obj.queued_at)
        .bind(Self::optional_bytes(&obj.metadata.encrypted_nonce))
        .bind(Self::optional_bytes(&obj.metadata.encrypted_blob))
        .bind(Self::optional_bytes(&obj.metadata.encrypted_key))
        .bind(Self::clear_metadata_value(&obj.metadata))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Concurrently migrated, deleted, or re-queued.
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    fn objects_for_migration(
        &self,
        project_id: Uuid,
        start_time: Option<OffsetDateTime>,
    ) -> ObjectStream<'_> {
        let pool = self.pool.clone();

        async move {
            let sql = match start_time {
                Some(_) => format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects \
                     WHERE project_id = $1 AND metasearch_queued_at IS NOT NULL \
                       AND metasearch_queued_at >= $2 \
                     ORDER BY metasearch_queued_at"
                ),
                None => format!(
                    "SELECT {OBJECT_COLUMNS} FROM objects \
                     WHERE project_id = $1 AND metasearch_queued_at IS NOT NULL \
                     ORDER BY metasearch_queued_at"
                ),
            };

            let mut query = sqlx::query_as::<_, ObjectRow>(&sql).bind(project_id);
            if let Some(start) = start_time {
                query = query.bind(start);
            }

            match query.fetch_all(&pool).await {
                Ok(rows) => stream::iter(
                    rows.into_iter()
                        .map(ObjectRow::into_object_info)
                        .collect::<Vec<_>>(),
                )
                .left_stream(),
                Err(e) => stream::once(async move { Err(RepoError::from(e)) }).right_stream(),
            }
        }
        .flatten_stream()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_search_columns_and_indexes() {
        assert!(SCHEMA.contains("clear_metadata JSONB"));
        assert!(SCHEMA.contains("USING GIN (clear_metadata)"));
        assert!(SCHEMA.contains("metasearch_queued_at TIMESTAMPTZ"));
        assert!(SCHEMA.contains("WHERE metasearch_queued_at IS NOT NULL"));
        assert!(SCHEMA.contains("CREATE TRIGGER objects_metasearch_queue"));
    }
}
