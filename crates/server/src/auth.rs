//! Authentication and authorization contracts.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use keyhole_access::{AccessGrant, Action, Encryptor, GrantEncryptor};
use keyhole_core::location::ObjectLocation;
use std::sync::Arc;
use uuid::Uuid;

/// The outcome of authenticating a request: the project it targets, the
/// decryption capability derived from its access grant, and the authorizer
/// that checks individual operations.
pub struct AuthContext {
    pub project_id: Uuid,
    pub encryptor: Arc<dyn Encryptor>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

/// Authenticates HTTP requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> ApiResult<AuthContext>;
}

/// Authorizes individual operations against the access grant.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, encrypted_location: &ObjectLocation, action: Action) -> ApiResult<()>;
}

/// Extract the bearer token from the Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Authenticates requests by parsing the bearer value as an access grant.
#[derive(Default)]
pub struct GrantAuthenticator;

impl GrantAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Authenticator for GrantAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> ApiResult<AuthContext> {
        let raw = extract_bearer_token(headers)
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

        let grant = AccessGrant::parse(raw)
            .map_err(|e| ApiError::Unauthorized(format!("cannot parse access token: {e}")))?;

        Ok(AuthContext {
            project_id: grant.project_id,
            encryptor: Arc::new(GrantEncryptor::new(&grant)),
            authorizer: Arc::new(GrantAuthorizer { grant }),
        })
    }
}

/// Authorizes operations using the grant's action set and key scopes.
pub struct GrantAuthorizer {
    grant: AccessGrant,
}

impl Authorizer for GrantAuthorizer {
    fn authorize(&self, encrypted_location: &ObjectLocation, action: Action) -> ApiResult<()> {
        if !self.grant.allows(action) {
            return Err(ApiError::Forbidden(format!(
                "the access token does not permit {action:?}"
            )));
        }

        // Path scoping is enforced by encryption: a grant without a key for
        // the path cannot even produce the encrypted location. The remaining
        // hole is the whole-bucket case, where there is no path to encrypt.
        if encrypted_location.object_key.is_empty()
            && !self.grant.has_root_key(&encrypted_location.bucket)
        {
            return Err(ApiError::Forbidden(
                "the access token does not have permission for the whole bucket".to_string(),
            ));
        }

        Ok(())
    }
}
