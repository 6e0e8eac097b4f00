//! API v1 routes.

mod jobs;
mod resources;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::routes())
        .nest("/resources", resources::routes())
}
