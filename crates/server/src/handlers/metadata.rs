//! CRUD handlers for per-object metadata.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_json_body, validate_request};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use keyhole_access::Action;
use keyhole_core::location::{JsonMap, ObjectMetadata};
use serde_json::Value;

/// GET /metadata/{bucket}/{key} — fetch cleartext metadata.
///
/// If the fetched row is still queued, the object is migrated inline so the
/// response reflects the latest external write even when the request's wait
/// was satisfied by an earlier run.
pub async fn get_metadata(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = validate_request(&state, &headers, &bucket, &key).await?;
    ctx.authorizer
        .authorize(&ctx.encrypted_location, Action::Read)?;

    let mut obj = state.repo.get_metadata(&ctx.encrypted_location).await?;

    if obj.queued_at.is_some()
        && let Err(e) = state.migrator.migrate_object(&mut obj).await
    {
        tracing::debug!(
            project_id = %ctx.project_id,
            object_key = %key,
            error = %e,
            "inline migration failed, serving stored metadata"
        );
    }

    if obj.metadata.clear.is_none() && obj.metadata.encrypted_blob.is_empty() {
        return Err(ApiError::NotFound);
    }

    Ok(Json(
        obj.metadata.clear.map(Value::Object).unwrap_or(Value::Null),
    ))
}

/// PUT /metadata/{bucket}/{key} — replace metadata.
pub async fn update_metadata(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let ctx = validate_request(&state, &headers, &bucket, &key).await?;
    ctx.authorizer
        .authorize(&ctx.encrypted_location, Action::Write)?;

    let clear: JsonMap = parse_json_body(&body)?;

    let mut meta = ObjectMetadata {
        clear: Some(clear),
        ..Default::default()
    };
    ctx.encryptor
        .encrypt_metadata(&bucket, &key, &mut meta)
        .map_err(|_| ApiError::BadRequest("cannot encrypt metadata".to_string()))?;

    state
        .repo
        .update_metadata(&ctx.encrypted_location, &meta)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /metadata/{bucket}/{key} — clear metadata.
pub async fn delete_metadata(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let ctx = validate_request(&state, &headers, &bucket, &key).await?;
    ctx.authorizer
        .authorize(&ctx.encrypted_location, Action::Delete)?;

    state.repo.delete_metadata(&ctx.encrypted_location).await?;

    Ok(StatusCode::NO_CONTENT)
}
