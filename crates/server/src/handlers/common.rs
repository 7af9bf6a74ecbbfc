//! Shared handler helpers.

use crate::auth::Authorizer;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::http::HeaderMap;
use keyhole_access::Encryptor;
use keyhole_core::location::ObjectLocation;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a handler needs after authentication: the project, the
/// request's capability, and the target location in both its cleartext and
/// encrypted forms.
pub struct RequestContext {
    pub project_id: Uuid,
    pub encryptor: Arc<dyn Encryptor>,
    pub authorizer: Arc<dyn Authorizer>,
    pub location: ObjectLocation,
    pub encrypted_location: ObjectLocation,
}

/// Authenticate the request, gate it on the project's migration queue, and
/// resolve the target location.
///
/// The gate registers the request's capability with the project worker and
/// waits, bounded, for a drain; when the wait times out the request fails
/// with "metadata is being indexed" rather than serving stale rows.
pub async fn validate_request(
    state: &AppState,
    headers: &HeaderMap,
    bucket: &str,
    key: &str,
) -> ApiResult<RequestContext> {
    let auth = state.auth.authenticate(headers).await?;

    state
        .migrator
        .add_project(auth.project_id, Arc::clone(&auth.encryptor));
    if !state
        .migrator
        .wait_for_project(auth.project_id, state.config.server.migration_timeout())
        .await
    {
        return Err(ApiError::MigrationInProgress);
    }

    let encrypted_key = auth.encryptor.encrypt_path(bucket, key).map_err(|_| {
        ApiError::Forbidden(format!(
            "the access token does not have permission for path '{key}'"
        ))
    })?;

    Ok(RequestContext {
        project_id: auth.project_id,
        encryptor: auth.encryptor,
        authorizer: auth.authorizer,
        location: ObjectLocation::new(auth.project_id, bucket, key),
        encrypted_location: ObjectLocation::new(auth.project_id, bucket, encrypted_key),
    })
}

/// Decode a JSON request body with a bad-request error on failure.
pub fn parse_json_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("error decoding request body: {e}")))
}
