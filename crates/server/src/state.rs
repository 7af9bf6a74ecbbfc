//! Application state shared across handlers.

use crate::auth::Authenticator;
use crate::migrate::MetadataMigrator;
use keyhole_core::config::AppConfig;
use keyhole_metadata::MetadataRepo;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata repository.
    pub repo: Arc<dyn MetadataRepo>,
    /// Request authenticator.
    pub auth: Arc<dyn Authenticator>,
    /// Migration supervisor.
    pub migrator: Arc<MetadataMigrator>,
}

impl AppState {
    /// Create a new application state. The migration supervisor is created
    /// here but not started; call `migrator.start` once the server runs.
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn MetadataRepo>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let migrator = Arc::new(MetadataMigrator::new(
            Arc::clone(&repo),
            config.server.max_capabilities,
        ));

        Self {
            config: Arc::new(config),
            repo,
            auth,
            migrator,
        }
    }
}
