//! Containment query planner.
//!
//! A match object is decomposed into single-path containment leaves, and the
//! backing query intersects one GIN-indexable `clear_metadata @> leaf`
//! candidate set per leaf on the identity quadruple. Planners that hand the
//! optimizer a single multi-valued JSONB containment get unpredictable plans
//! (often a full scan); an intersection of single-valued containments does
//! not.

use crate::error::{RepoError, RepoResult};
use keyhole_core::codec::split_to_leaves;
use keyhole_core::location::{JsonMap, ObjectLocation, prefix_limit};
use serde_json::Value;

/// Ceiling on containment leaves per query.
pub const MAX_MATCH_LEAVES: usize = 10;

/// Columns selected for every object read.
pub(crate) const OBJECT_COLUMNS: &str = "project_id, bucket_name, object_key, version, status, \
     encrypted_metadata_nonce, encrypted_metadata, encrypted_metadata_encrypted_key, \
     clear_metadata, metasearch_queued_at";

/// A planned search query: the SQL text plus the values to bind, in
/// placeholder order (leaves, project/bucket/status, range bounds, limit).
#[derive(Debug)]
pub struct SearchPlan {
    pub sql: String,
    pub leaves: Vec<Value>,
    /// Lower bound for the first page: the location's key prefix (inclusive).
    /// `None` when paging from a token.
    pub first_page_key: Option<String>,
    /// Exclusive lower bound for subsequent pages.
    pub start_after: Option<ObjectLocation>,
    /// Exclusive upper bound of the key-prefix range, when bounded.
    pub prefix_limit: Option<Vec<u8>>,
    pub batch_size: i64,
}

/// Plan a containment query for objects under `loc` whose cleartext metadata
/// contains `match_query`.
pub fn build_search_plan(
    loc: &ObjectLocation,
    match_query: &JsonMap,
    start_after: Option<&ObjectLocation>,
    batch_size: usize,
) -> RepoResult<SearchPlan> {
    let leaves = split_to_leaves(&Value::Object(match_query.clone()));
    if leaves.len() > MAX_MATCH_LEAVES {
        return Err(RepoError::BadRequest(
            "too many values in metadata query".to_string(),
        ));
    }

    let mut sql = format!("SELECT {OBJECT_COLUMNS}\nFROM objects\nWHERE ");
    let mut args = 0usize;

    if !leaves.is_empty() {
        sql.push_str("(project_id, bucket_name, object_key, version) IN (");
        for i in 0..leaves.len() {
            if i > 0 {
                sql.push_str("\nINTERSECT\n");
            }
            args += 1;
            sql.push_str(&format!(
                "(SELECT project_id, bucket_name, object_key, version FROM objects \
                 WHERE clear_metadata @> ${args})"
            ));
        }
        sql.push_str(")\nAND ");
    }

    sql.push_str(&format!(
        "project_id = ${} AND bucket_name = ${} AND status <> ${} \
         AND (expires_at IS NULL OR expires_at > now())",
        args + 1,
        args + 2,
        args + 3,
    ));
    args += 3;

    let (first_page_key, start_after) = match start_after {
        None => {
            // First page: half-open range starting at the key prefix.
            sql.push_str(&format!(
                "\nAND (project_id, bucket_name, object_key, version) >= (${}, ${}, ${}, ${})",
                args + 1,
                args + 2,
                args + 3,
                args + 4,
            ));
            args += 4;
            (Some(loc.object_key.clone()), None)
        }
        Some(after) => {
            // Subsequent pages: strictly after the token's location.
            sql.push_str(&format!(
                "\nAND (project_id, bucket_name, object_key, version) > (${}, ${}, ${}, ${})",
                args + 1,
                args + 2,
                args + 3,
                args + 4,
            ));
            args += 4;
            (None, Some(after.clone()))
        }
    };

    let limit = if loc.object_key.is_empty() {
        None
    } else {
        prefix_limit(&loc.object_key)
    };
    if limit.is_some() {
        sql.push_str(&format!(
            "\nAND (project_id, bucket_name, object_key, version) < (${}, ${}, ${}, ${})",
            args + 1,
            args + 2,
            args + 3,
            args + 4,
        ));
        args += 4;
    }

    sql.push_str(&format!(
        "\nORDER BY project_id, bucket_name, object_key, version LIMIT ${}",
        args + 1,
    ));

    Ok(SearchPlan {
        sql,
        leaves,
        first_page_key,
        start_after,
        prefix_limit: limit,
        batch_size: batch_size as i64,
    })
}
