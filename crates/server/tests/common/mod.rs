//! Server test utilities.

pub mod repo;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use keyhole_access::{AccessGrant, Encryptor, GrantEncryptor};
use keyhole_core::config::AppConfig;
use keyhole_core::location::ObjectMetadata;
use keyhole_metadata::MetadataRepo;
use keyhole_server::{AppState, GrantAuthenticator, create_router};
use repo::MemoryRepo;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

/// A test server with an in-memory repository and a root access grant.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    pub repo: Arc<MemoryRepo>,
    pub grant: AccessGrant,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server whose default grant covers `testbucket`.
    pub fn new() -> Self {
        let repo = Arc::new(MemoryRepo::new());
        let state = AppState::new(
            AppConfig::for_testing(),
            Arc::clone(&repo) as Arc<dyn MetadataRepo>,
            Arc::new(GrantAuthenticator::new()),
        );
        let router = create_router(state.clone());
        let grant = AccessGrant::root(Uuid::new_v4(), &["testbucket"]);

        Self {
            router,
            state,
            repo,
            grant,
        }
    }

    /// The bearer value for the default grant.
    pub fn bearer(&self) -> String {
        self.grant.serialize()
    }

    /// An encryptor over the default grant.
    pub fn encryptor(&self) -> GrantEncryptor {
        GrantEncryptor::new(&self.grant)
    }

    /// The default grant's encrypted form of a path.
    pub fn encrypted_key(&self, bucket: &str, path: &str) -> String {
        self.encryptor().encrypt_path(bucket, path).unwrap()
    }

    /// Seal `clear` the way an external writer holding `grant` would,
    /// leaving the cleartext column untouched.
    pub fn seal_with(
        &self,
        grant: &AccessGrant,
        bucket: &str,
        path: &str,
        clear: Value,
    ) -> ObjectMetadata {
        let encryptor = GrantEncryptor::new(grant);
        let mut meta = ObjectMetadata {
            clear: Some(
                clear
                    .as_object()
                    .expect("metadata must be an object")
                    .clone(),
            ),
            ..Default::default()
        };
        encryptor.encrypt_metadata(bucket, path, &mut meta).unwrap();
        meta.clear = None;
        meta
    }
}

/// Make a JSON request against the router and decode the response.
#[allow(dead_code)]
pub async fn json_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}
