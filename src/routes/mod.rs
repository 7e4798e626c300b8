pub mod health;
pub mod query;
pub mod targets;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(crate::openapi::router())
        .nest(
            "/api",
            Router::new().merge(query::router()).merge(targets::router()),
        )
        .with_state(state)
}
