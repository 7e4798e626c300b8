use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "metaqueries-server",
        description = "Derived time-series queries (TimeShift, MovingAverage, Arithmetic) federated over underlying series sources."
    ),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::query::run_query,
        crate::routes::targets::list_targets
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::query::QueryRequest,
        crate::routes::query::QueryResponse,
        crate::routes::targets::TargetsResponse,
        crate::services::federation::QuerySpec,
        crate::services::federation::NamedSeries,
        crate::services::federation::SeriesPoint,
        crate::services::federation::QueryErrorBody,
        crate::services::sources::SeriesRequest,
        crate::services::sources::SeriesResult,
        crate::services::sources::NumericField,
        crate::time::TimeRange
    )),
    tags((name = "queries", description = "Derived query execution"))
)]
pub struct ApiDoc;

pub fn openapi_json() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/openapi.json", get(openapi_handler))
}
