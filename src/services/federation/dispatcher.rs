use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::context::{ExecutionContext, SlotHandle};
use super::error::QueryError;
use super::executor::Executor;
use super::graph::plan_dependencies;
use super::types::{validate_batch, DerivedQuery, NamedSeries, QuerySpec, QueryType};
use crate::services::sources::SourceRegistry;
use crate::services::templates::{substitute_expression, TemplateSubstitutor};
use crate::time::TimeRange;

pub const PING_MESSAGE: &str = "Meta Source is working correctly";

/// Symbolic ids offered to callers authoring Arithmetic expressions.
pub const DEFAULT_TARGETS: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingStatus {
    pub ok: bool,
    pub message: String,
}

/// Outcome of one batch: successful series in batch order plus per-query failures.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<NamedSeries>,
    pub errors: BTreeMap<String, QueryError>,
}

#[derive(Clone)]
pub struct FederationService {
    registry: Arc<SourceRegistry>,
}

impl FederationService {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    /// Availability check; never touches a series source.
    pub fn ping(&self) -> PingStatus {
        PingStatus {
            ok: true,
            message: PING_MESSAGE.to_string(),
        }
    }

    pub fn available_targets(&self) -> Vec<String> {
        DEFAULT_TARGETS.iter().map(|id| id.to_string()).collect()
    }

    /// Runs one batch of derived queries over `range`.
    ///
    /// Validation and dependency cycles reject the batch before any source is called.
    /// Per-query failures come back in [`BatchResult::errors`] next to the successful series.
    /// Cancelling `cancel` drops every in-flight fetch and wait and discards partial results.
    pub async fn execute(
        &self,
        queries: Vec<QuerySpec>,
        range: TimeRange,
        templates: &dyn TemplateSubstitutor,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let mut specs: Vec<QuerySpec> = queries
            .into_iter()
            .filter(|spec| !spec.is_suppressed())
            .collect();
        for spec in &mut specs {
            if let Some(expression) = spec.expression.as_mut() {
                *expression = substitute_expression(expression, templates);
            }
        }

        let queries = validate_batch(&specs)?;
        if queries.is_empty() {
            return Ok(BatchResult::default());
        }

        // Arithmetic queries read other slots, never a source.
        let mut by_source: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for query in queries
            .iter()
            .filter(|q| q.query_type() != QueryType::Arithmetic)
        {
            by_source
                .entry(self.registry.resolve_name(query.datasource.as_deref()))
                .or_default()
                .push(query.id.as_str());
        }

        let plan = plan_dependencies(&queries)?;
        for (query_id, missing) in &plan.missing {
            tracing::debug!(query_id = %query_id, missing = ?missing, "query references ids outside the batch");
        }

        let mut ctx = ExecutionContext::new();
        let mut slots: HashMap<&str, SlotHandle> = HashMap::with_capacity(queries.len());
        for query in &queries {
            slots.insert(query.id.as_str(), ctx.register(&query.id)?);
        }

        let mut executor = Executor::new(&self.registry, range);
        for (source, ids) in &by_source {
            match executor.bind_source(source) {
                Ok(()) => {
                    tracing::debug!(source = %source, queries = ?ids, "partitioned derived queries")
                }
                Err(reason) => {
                    tracing::warn!(source = %source, queries = ?ids, reason = %reason, "source partition cannot be queried")
                }
            }
        }

        let arithmetic = queries.len() - by_source.values().map(Vec::len).sum::<usize>();
        tracing::info!(
            queries = queries.len(),
            arithmetic,
            sources = by_source.len(),
            range = %range,
            "executing derived query batch"
        );

        // Launch in dependency order so producers are polled ahead of their dependents.
        let by_id: HashMap<&str, &DerivedQuery> =
            queries.iter().map(|q| (q.id.as_str(), q)).collect();
        let mut runs = Vec::with_capacity(plan.order.len());
        for id in &plan.order {
            let (Some(query), Some(slot)) = (by_id.get(id.as_str()).copied(), slots.remove(id.as_str()))
            else {
                continue;
            };
            let executor = &executor;
            let ctx = &ctx;
            runs.push(async move {
                let result = executor.run(query, ctx).await;
                if let Err(err) = &result {
                    tracing::warn!(
                        query_id = %query.id,
                        query_type = query.query_type().as_str(),
                        code = err.code(),
                        error = %err,
                        "derived query failed"
                    );
                }
                (slot.id().to_string(), slot.complete(result))
            });
        }

        let completed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(range = %range, "derived query batch cancelled");
                return Err(QueryError::Cancelled);
            }
            completed = join_all(runs) => completed,
        };

        let mut completed: HashMap<String, _> = completed.into_iter().collect();
        let mut batch = BatchResult::default();
        for query in &queries {
            let Some(result) = completed.remove(&query.id) else {
                continue;
            };
            match &*result {
                Ok(series) => batch.results.push(series.clone()),
                Err(err) => {
                    batch.errors.insert(query.id.clone(), err.clone());
                }
            }
        }
        Ok(batch)
    }
}
