//! Read-only view of the resource pool.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::resources::Resource;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_resources))
        .route("/available-cpus", get(available_cpus))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResourcesResponse {
    pub pool: String,
    pub items: Vec<Resource>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailableCpusResponse {
    pub available_cpus: u64,
}

async fn list_resources(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let resources = state.manager().resources();
    let items = resources.get_resources().await?;
    Ok(Json(ListResourcesResponse {
        pool: resources.pool().to_string(),
        items,
    }))
}

async fn available_cpus(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let available_cpus = state.manager().resources().get_available_cpu_count().await?;
    Ok(Json(AvailableCpusResponse { available_cpus }))
}
