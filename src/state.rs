use axum::extract::FromRef;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::services::federation::FederationService;

#[derive(Clone)]
pub struct AppState {
    pub federation: Arc<FederationService>,
    /// Cancelled on shutdown; every query batch runs under a child of this token.
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for Arc<FederationService> {
    fn from_ref(state: &AppState) -> Arc<FederationService> {
        state.federation.clone()
    }
}
