use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::error::QueryError;
use super::types::NamedSeries;

pub type SlotResult = Arc<Result<NamedSeries, QueryError>>;

type SlotState = Option<SlotResult>;

/// Per-batch map from query id to its pending or completed result.
///
/// Every slot is registered before any executor starts, so forward references inside a batch
/// resolve no matter where the referenced query appears. A context is built for one batch and
/// dropped with it.
#[derive(Default)]
pub struct ExecutionContext {
    slots: HashMap<String, watch::Receiver<SlotState>>,
}

/// Write side of one slot; completing it wakes every waiter.
pub struct SlotHandle {
    id: String,
    tx: watch::Sender<SlotState>,
}

impl SlotHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn complete(self, result: Result<NamedSeries, QueryError>) -> SlotResult {
        let result = Arc::new(result);
        self.tx.send_replace(Some(result.clone()));
        result
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str) -> Result<SlotHandle, QueryError> {
        if self.slots.contains_key(id) {
            return Err(QueryError::Validation {
                query_id: Some(id.to_string()),
                message: format!("query id \"{id}\" is registered twice"),
            });
        }
        let (tx, rx) = watch::channel(None);
        self.slots.insert(id.to_string(), rx);
        Ok(SlotHandle {
            id: id.to_string(),
            tx,
        })
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Waits until `id` completes. Unregistered ids fail immediately as a missing dependency
    /// of `dependent`; a slot whose writer vanished without completing reads as a failure.
    pub async fn wait(&self, id: &str, dependent: &str) -> Result<SlotResult, QueryError> {
        let mut rx = self
            .slots
            .get(id)
            .cloned()
            .ok_or_else(|| QueryError::MissingDependency {
                query_id: dependent.to_string(),
                dependency: id.to_string(),
            })?;

        let guard = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| QueryError::DependencyFailed {
                query_id: dependent.to_string(),
                dependency: id.to_string(),
            })?;
        (*guard).clone().ok_or_else(|| QueryError::DependencyFailed {
            query_id: dependent.to_string(),
            dependency: id.to_string(),
        })
    }
}
