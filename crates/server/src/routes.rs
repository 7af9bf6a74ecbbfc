//! Route configuration.

use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // CRUD on per-object metadata
        .route(
            "/metadata/{bucket}/{*key}",
            get(handlers::get_metadata)
                .put(handlers::update_metadata)
                .delete(handlers::delete_metadata),
        )
        // Search
        .route("/metasearch/{bucket}", post(handlers::search_metadata))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
