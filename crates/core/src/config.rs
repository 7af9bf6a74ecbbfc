//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:9998").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// How long a request waits for its project's migration queue to drain
    /// before failing with "metadata is being indexed".
    #[serde(default = "default_migration_timeout_secs")]
    pub migration_timeout_secs: u64,
    /// Interval between best-effort background sweeps of all project queues.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum number of decryption capabilities retained per project.
    #[serde(default = "default_max_capabilities")]
    pub max_capabilities: usize,
}

fn default_bind() -> String {
    "127.0.0.1:9998".to_string()
}

fn default_migration_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    1
}

fn default_max_capabilities() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            migration_timeout_secs: default_migration_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_capabilities: default_max_capabilities(),
        }
    }
}

impl ServerConfig {
    /// Per-request migration wait as a Duration.
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    /// Background sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Optional statement timeout to prevent hung queries.
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

fn default_max_connections() -> u32 {
    10
}

/// Top-level application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

impl AppConfig {
    /// Create a test configuration with short timeouts.
    ///
    /// **For testing only.** Points at a database that is not expected to
    /// exist; tests substitute an in-memory repository.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                migration_timeout_secs: 2,
                ..Default::default()
            },
            database: DatabaseConfig {
                url: "postgres://localhost/keyhole_test".to_string(),
                max_connections: default_max_connections(),
                statement_timeout_ms: None,
            },
        }
    }
}
