use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::services::federation::FederationService;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct TargetsResponse {
    /// Symbolic ids usable as references in Arithmetic expressions.
    pub targets: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/targets",
    tag = "queries",
    responses((status = 200, description = "Default query ids", body = TargetsResponse))
)]
pub(crate) async fn list_targets(
    State(federation): State<Arc<FederationService>>,
) -> Json<TargetsResponse> {
    Json(TargetsResponse {
        targets: federation.available_targets(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/targets", get(list_targets))
}
