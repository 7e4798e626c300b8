use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};
use crate::services::federation::{NamedSeries, QueryErrorBody, QuerySpec};
use crate::services::templates::VariableMap;
use crate::state::AppState;
use crate::time::TimeRange;

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct QueryRequest {
    pub range: TimeRange,
    pub queries: Vec<QuerySpec>,
    /// Template variables substituted into Arithmetic expressions.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct QueryResponse {
    pub results: Vec<NamedSeries>,
    /// Per-query failures keyed by query id.
    pub errors: BTreeMap<String, QueryErrorBody>,
}

#[utoipa::path(
    post,
    path = "/api/query",
    tag = "queries",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Derived series plus per-query errors", body = QueryResponse),
        (status = 400, description = "Invalid batch or dependency cycle", body = QueryErrorBody),
        (status = 503, description = "Batch cancelled", body = QueryErrorBody)
    )
)]
pub(crate) async fn run_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> AppResult<Json<QueryResponse>> {
    let range = TimeRange::new(request.range.from, request.range.to).map_err(AppError::bad_request)?;
    let templates = VariableMap::new(request.variables);
    let cancel = state.shutdown.child_token();

    let batch = state
        .federation
        .execute(request.queries, range, &templates, &cancel)
        .await?;

    if !batch.errors.is_empty() {
        tracing::info!(
            failed = batch.errors.len(),
            succeeded = batch.results.len(),
            "derived query batch completed with failures"
        );
    }

    Ok(Json(QueryResponse {
        results: batch.results,
        errors: batch
            .errors
            .iter()
            .map(|(id, err)| (id.clone(), err.to_api_error()))
            .collect(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/query", post(run_query))
}
