//! Keyhole server: HTTP API and migration engine.
//!
//! The server answers structured metadata queries against the server-side
//! cleartext column while staying wire-compatible with clients that only
//! write the encrypted channel: every request registers its decryption
//! capability, and per-project background workers migrate externally-written
//! objects into the cleartext column.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod migrate;
pub mod routes;
pub mod state;

pub use auth::{AuthContext, Authenticator, Authorizer, GrantAuthenticator};
pub use error::{ApiError, ApiResult};
pub use migrate::{MetadataMigrator, MigrationError, MigrationWorker};
pub use routes::create_router;
pub use state::AppState;
