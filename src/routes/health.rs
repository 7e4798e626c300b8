use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::services::federation::FederationService;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "OK", body = HealthResponse))
)]
pub(crate) async fn healthz_handler(
    State(federation): State<Arc<FederationService>>,
) -> Json<HealthResponse> {
    let ping = federation.ping();
    Json(HealthResponse {
        status: (if ping.ok { "ok" } else { "error" }).to_string(),
        message: ping.message,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
