use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::Arc;

use super::context::ExecutionContext;
use super::error::QueryError;
use super::types::{DerivedQuery, DerivedQueryKind, NamedSeries, SeriesPoint};
use crate::services::expression::{CompiledExpression, ExpressionError};
use crate::services::sources::{
    SeriesRequest, SeriesSource, SourceError, SourceRegistry, FEDERATION_CAPABILITY_ID,
};
use crate::time::{self, TimeRange, TimeShiftUnit};

/// Timestamps plus the selected numeric field of one sub-request.
#[derive(Debug, Clone, Default, PartialEq)]
struct FetchedSeries {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<Option<f64>>,
}

#[derive(Clone)]
struct ResolvedSource {
    name: String,
    source: Arc<dyn SeriesSource>,
}

/// Runs single derived queries against the ambient range of one batch.
pub struct Executor<'a> {
    registry: &'a SourceRegistry,
    range: TimeRange,
    bound: HashMap<String, Result<ResolvedSource, String>>,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a SourceRegistry, range: TimeRange) -> Self {
        Self {
            registry,
            range,
            bound: HashMap::new(),
        }
    }

    /// Resolves the source behind one partition of the batch once, up front. Queries of that
    /// partition reuse the binding; a refusal is returned so the caller can report it once.
    pub fn bind_source(&mut self, name: &str) -> Result<(), String> {
        let resolved = self.lookup(name);
        let outcome = resolved.as_ref().map(|_| ()).map_err(String::clone);
        self.bound.insert(name.to_string(), resolved);
        outcome
    }

    pub async fn run(
        &self,
        query: &DerivedQuery,
        ctx: &ExecutionContext,
    ) -> Result<NamedSeries, QueryError> {
        match &query.kind {
            DerivedQueryKind::TimeShift {
                source_query_id,
                metric,
                periods,
                unit,
            } => {
                self.time_shift(query, source_query_id, metric.as_deref(), *periods, *unit)
                    .await
            }
            DerivedQueryKind::MovingAverage {
                source_query_id,
                metric,
                periods,
            } => {
                self.moving_average(query, source_query_id, metric.as_deref(), *periods)
                    .await
            }
            DerivedQueryKind::Arithmetic { expression } => {
                self.arithmetic(query, expression, ctx).await
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<ResolvedSource, String> {
        let source = self
            .registry
            .get(name)
            .ok_or_else(|| format!("unknown series source \"{name}\""))?;
        if source.capability_id() == FEDERATION_CAPABILITY_ID {
            return Err(format!(
                "source \"{name}\" is this federation layer; derived queries cannot target it"
            ));
        }
        Ok(ResolvedSource {
            name: name.to_string(),
            source,
        })
    }

    fn resolve_source(&self, query: &DerivedQuery) -> Result<ResolvedSource, QueryError> {
        let name = self.registry.resolve_name(query.datasource.as_deref());
        let resolved = match self.bound.get(&name) {
            Some(bound) => bound.clone(),
            None => self.lookup(&name),
        };
        resolved.map_err(|message| QueryError::Configuration {
            query_id: query.id.clone(),
            message,
        })
    }

    async fn fetch(
        &self,
        query: &DerivedQuery,
        resolved: &ResolvedSource,
        range: TimeRange,
        source_query_id: &str,
        metric: Option<&str>,
        sub_request: String,
    ) -> Result<FetchedSeries, QueryError> {
        let upstream = |cause: SourceError| QueryError::Upstream {
            query_id: query.id.clone(),
            source_name: resolved.name.clone(),
            sub_request: sub_request.clone(),
            cause,
        };

        let request = SeriesRequest {
            ref_id: source_query_id.to_string(),
            query: source_query_id.to_string(),
            metric: metric.map(str::to_string),
        };
        tracing::debug!(
            query_id = %query.id,
            source = %resolved.name,
            sub_request = %sub_request,
            range = %range,
            "querying series source"
        );
        let results = resolved
            .source
            .query(range, vec![request])
            .await
            .map_err(&upstream)?;

        let result = match results.iter().find(|r| r.ref_id == source_query_id) {
            Some(result) => result,
            None if results.len() == 1 => &results[0],
            None => {
                return Err(upstream(SourceError::Malformed(format!(
                    "no result for {source_query_id}"
                ))))
            }
        };

        let Some(field) = result.value_field(metric) else {
            if result.timestamps.is_empty() {
                return Ok(FetchedSeries::default());
            }
            return Err(upstream(SourceError::Malformed(
                "result has timestamps but no numeric field".to_string(),
            )));
        };
        if field.values.len() != result.timestamps.len() {
            return Err(upstream(SourceError::Malformed(format!(
                "field {} has {} values for {} timestamps",
                field.name,
                field.values.len(),
                result.timestamps.len()
            ))));
        }

        Ok(FetchedSeries {
            timestamps: result.timestamps.clone(),
            values: field.values.clone(),
        })
    }

    /// Fetches the shifted range and re-stamps the samples onto the ambient range.
    async fn time_shift(
        &self,
        query: &DerivedQuery,
        source_query_id: &str,
        metric: Option<&str>,
        periods: u32,
        unit: TimeShiftUnit,
    ) -> Result<NamedSeries, QueryError> {
        let resolved = self.resolve_source(query)?;
        let shifted =
            time::shift(self.range, periods, unit).map_err(|message| QueryError::TimeRange {
                query_id: query.id.clone(),
                message,
            })?;

        let fetched = self
            .fetch(
                query,
                &resolved,
                shifted,
                source_query_id,
                metric,
                format!("{source_query_id} shifted {periods} {}", unit.as_str()),
            )
            .await?;

        // `shift` preserves the duration, so the offset into the shifted range maps exactly
        // onto the ambient range for every unit, months included.
        let points = fetched
            .timestamps
            .iter()
            .zip(fetched.values.iter())
            .map(|(ts, value)| {
                let timestamp = self
                    .range
                    .from
                    .checked_add_signed(*ts - shifted.from)
                    .ok_or_else(|| QueryError::TimeRange {
                        query_id: query.id.clone(),
                        message: format!(
                            "sample at {} cannot be re-stamped onto {}",
                            ts.to_rfc3339(),
                            self.range
                        ),
                    })?;
                Ok::<_, QueryError>(SeriesPoint {
                    timestamp,
                    value: *value,
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;

        Ok(NamedSeries::new(
            &query.id,
            &query.output_name,
            self.range,
            points,
        ))
    }

    /// Averages `periods` contiguous windows position by position. Missing or short windows
    /// lower the divisor at the affected positions.
    async fn moving_average(
        &self,
        query: &DerivedQuery,
        source_query_id: &str,
        metric: Option<&str>,
        periods: u32,
    ) -> Result<NamedSeries, QueryError> {
        let resolved = self.resolve_source(query)?;
        let windows =
            time::windows(self.range, periods).map_err(|message| QueryError::TimeRange {
                query_id: query.id.clone(),
                message,
            })?;

        let fetches = windows.iter().enumerate().map(|(idx, window)| {
            self.fetch(
                query,
                &resolved,
                *window,
                source_query_id,
                metric,
                format!("{source_query_id} window {idx}"),
            )
        });
        let fetched = join_all(fetches)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, QueryError>>()?;

        let Some(base) = fetched.first() else {
            return Ok(NamedSeries::new(
                &query.id,
                &query.output_name,
                self.range,
                Vec::new(),
            ));
        };

        let mut short_windows = 0usize;
        for window in fetched.iter().skip(1) {
            if window.values.len() < base.values.len() {
                short_windows += 1;
            }
        }
        if short_windows > 0 {
            tracing::debug!(
                query_id = %query.id,
                short_windows,
                "moving average windows returned fewer samples than the latest window"
            );
        }

        let points = base
            .timestamps
            .iter()
            .enumerate()
            .map(|(idx, ts)| {
                let (sum, count) = fetched
                    .iter()
                    .filter_map(|window| window.values.get(idx).copied().flatten())
                    .fold((0.0_f64, 0usize), |(sum, count), v| (sum + v, count + 1));
                SeriesPoint {
                    timestamp: *ts,
                    value: (count > 0).then(|| sum / count as f64),
                }
            })
            .collect();

        Ok(NamedSeries::new(
            &query.id,
            &query.output_name,
            self.range,
            points,
        ))
    }

    /// Waits for every referenced query, then evaluates the expression per base timestamp.
    /// A sample that fails to evaluate is reported as `0` and counted.
    async fn arithmetic(
        &self,
        query: &DerivedQuery,
        expression: &CompiledExpression,
        ctx: &ExecutionContext,
    ) -> Result<NamedSeries, QueryError> {
        let references = expression.references();
        if let Some(missing) = references.iter().find(|r| !ctx.is_registered(r)) {
            return Err(QueryError::MissingDependency {
                query_id: query.id.clone(),
                dependency: missing.clone(),
            });
        }

        let completed =
            try_join_all(references.iter().map(|r| ctx.wait(r, &query.id))).await?;

        let mut inputs: HashMap<&str, &NamedSeries> = HashMap::new();
        for (reference, slot) in references.iter().zip(completed.iter()) {
            match &**slot {
                Ok(series) => {
                    inputs.insert(reference.as_str(), series);
                }
                Err(_) => {
                    return Err(QueryError::DependencyFailed {
                        query_id: query.id.clone(),
                        dependency: reference.clone(),
                    })
                }
            }
        }

        let base = references
            .iter()
            .filter_map(|r| inputs.get(r.as_str()))
            .find(|series| !series.points.is_empty());
        let Some(base) = base else {
            return Ok(NamedSeries::new(
                &query.id,
                &query.output_name,
                self.range,
                Vec::new(),
            ));
        };

        let mut degraded = 0usize;
        let mut first_error: Option<(usize, ExpressionError)> = None;
        let points = base
            .points
            .iter()
            .enumerate()
            .map(|(idx, point)| {
                let lookup = |name: &str| {
                    inputs
                        .get(name)
                        .and_then(|series| series.value_at(idx))
                        .unwrap_or(0.0)
                };
                let value = match expression.evaluate(&lookup) {
                    Ok(value) => value,
                    Err(err) => {
                        degraded += 1;
                        if first_error.is_none() {
                            first_error = Some((idx, err));
                        }
                        0.0
                    }
                };
                SeriesPoint {
                    timestamp: point.timestamp,
                    value: Some(value),
                }
            })
            .collect();

        if let Some((index, err)) = first_error {
            tracing::warn!(
                query_id = %query.id,
                expression = %expression.expression(),
                degraded_samples = degraded,
                first_index = index,
                error = %err,
                "arithmetic samples failed to evaluate; reported as 0"
            );
        }

        let mut series = NamedSeries::new(&query.id, &query.output_name, self.range, points);
        series.degraded_samples = degraded;
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::federation::types::{validate_query, QuerySpec};
    use crate::test_support::{minute_timestamps, range, series_result, ScriptedSource};
    use chrono::{Duration, TimeZone};

    fn moving_average(periods: i64) -> DerivedQuery {
        validate_query(&QuerySpec {
            ref_id: "M".to_string(),
            query_type: Some("MovingAverage".to_string()),
            query: Some("A".to_string()),
            periods: Some(periods),
            ..Default::default()
        })
        .expect("valid")
    }

    fn registry_with(source: ScriptedSource) -> SourceRegistry {
        let mut registry = SourceRegistry::new("default");
        registry.register(Arc::new(source));
        registry
    }

    #[tokio::test]
    async fn time_shift_restamps_onto_ambient_range() {
        let source = ScriptedSource::constant("default", 5.0);
        let calls = source.calls();
        let registry = registry_with(source);
        let executor = Executor::new(&registry, range());
        let query = validate_query(&QuerySpec {
            ref_id: "B".to_string(),
            query: Some("A".to_string()),
            periods: Some(7),
            timeshift_unit: Some("days".to_string()),
            ..Default::default()
        })
        .expect("valid");

        let series = executor
            .run(&query, &ExecutionContext::new())
            .await
            .expect("series");

        let recorded = calls.lock().expect("calls");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0.from, range().from - Duration::days(7));
        assert_eq!(recorded[0].0.duration(), range().duration());

        assert_eq!(series.ref_id, "B");
        assert_eq!(series.name, "timeshift");
        assert_eq!(series.range, range());
        let stamps: Vec<_> = series.points.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, minute_timestamps(range()));
        assert_eq!(stamps.first().copied(), Some(range().from));
        assert!(stamps.iter().all(|ts| *ts < range().to));
        assert!(series.points.iter().all(|p| p.value == Some(5.0)));
    }

    #[tokio::test]
    async fn month_shift_across_month_end_stays_inside_ambient_range() {
        let source = ScriptedSource::responder("default", |window, request| {
            let mut timestamps = Vec::new();
            let mut ts = window.from;
            while ts < window.to {
                timestamps.push(ts);
                ts += Duration::hours(1);
            }
            let values = (0..timestamps.len()).map(|i| Some(i as f64)).collect();
            Ok(series_result(&request.ref_id, timestamps, values))
        });
        let registry = registry_with(source);
        let from = Utc
            .with_ymd_and_hms(2026, 3, 30, 22, 0, 0)
            .single()
            .expect("from");
        let ambient = TimeRange::new(from, from + Duration::hours(4)).expect("range");
        let executor = Executor::new(&registry, ambient);
        let query = validate_query(&QuerySpec {
            ref_id: "B".to_string(),
            query: Some("A".to_string()),
            periods: Some(1),
            timeshift_unit: Some("months".to_string()),
            ..Default::default()
        })
        .expect("valid");

        let series = executor
            .run(&query, &ExecutionContext::new())
            .await
            .expect("series");

        let stamps: Vec<_> = series.points.iter().map(|p| p.timestamp).collect();
        let expected: Vec<_> = (0..4).map(|h| from + Duration::hours(h)).collect();
        assert_eq!(stamps, expected);
        assert!(stamps
            .iter()
            .all(|ts| *ts >= ambient.from && *ts < ambient.to));
        assert_eq!(series.values(), vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[tokio::test]
    async fn moving_average_of_constant_windows_is_constant() {
        let registry = registry_with(ScriptedSource::constant("default", 4.5));
        let executor = Executor::new(&registry, range());
        let series = executor
            .run(&moving_average(3), &ExecutionContext::new())
            .await
            .expect("series");
        assert_eq!(series.name, "moving_average");
        assert_eq!(series.points.len(), 3);
        assert!(series.points.iter().all(|p| p.value == Some(4.5)));
    }

    #[tokio::test]
    async fn moving_average_divides_by_available_samples() {
        let base = range();
        let source = ScriptedSource::responder("default", move |window, request| {
            let stamps = minute_timestamps(window);
            let lag = (base.from - window.from).num_minutes() / 3;
            let values = match lag {
                0 => vec![Some(3.0), Some(3.0), Some(3.0)],
                1 => vec![Some(6.0), None, Some(6.0)],
                _ => vec![Some(9.0), Some(9.0)],
            };
            let stamps = stamps.into_iter().take(values.len()).collect();
            Ok(series_result(&request.ref_id, stamps, values))
        });
        let registry = registry_with(source);
        let executor = Executor::new(&registry, base);

        let series = executor
            .run(&moving_average(3), &ExecutionContext::new())
            .await
            .expect("series");
        assert_eq!(series.values(), vec![Some(6.0), Some(6.0), Some(4.5)]);
    }

    #[tokio::test]
    async fn failed_window_fails_the_query_with_context() {
        let registry = registry_with(ScriptedSource::failing(
            "default",
            SourceError::Status {
                status: 500,
                body: "boom".to_string(),
            },
        ));
        let executor = Executor::new(&registry, range());
        let err = executor
            .run(&moving_average(2), &ExecutionContext::new())
            .await
            .unwrap_err();
        match err {
            QueryError::Upstream {
                query_id,
                source_name,
                sub_request,
                ..
            } => {
                assert_eq!(query_id, "M");
                assert_eq!(source_name, "default");
                assert!(sub_request.starts_with("A window"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_sources_that_route_back_into_federation() {
        let registry =
            registry_with(ScriptedSource::constant("default", 1.0).with_capability(
                FEDERATION_CAPABILITY_ID,
            ));
        let executor = Executor::new(&registry, range());
        let err = executor
            .run(&moving_average(2), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn bound_partition_refusal_applies_to_its_queries() {
        let registry =
            registry_with(ScriptedSource::constant("default", 1.0).with_capability(
                FEDERATION_CAPABILITY_ID,
            ));
        let mut executor = Executor::new(&registry, range());
        let refusal = executor.bind_source("default").unwrap_err();
        assert!(refusal.contains("federation layer"));
        assert!(executor.bind_source("influx").is_err());

        let err = executor
            .run(&moving_average(2), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::Configuration {
                query_id: "M".to_string(),
                message: refusal,
            }
        );
    }

    #[tokio::test]
    async fn unknown_source_is_a_configuration_error() {
        let registry = registry_with(ScriptedSource::constant("default", 1.0));
        let executor = Executor::new(&registry, range());
        let mut query = moving_average(2);
        query.datasource = Some("influx".to_string());
        let err = executor
            .run(&query, &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("influx"));
    }

    fn points(values: &[Option<f64>]) -> Vec<SeriesPoint> {
        minute_timestamps(range())
            .into_iter()
            .zip(values.iter())
            .map(|(timestamp, value)| SeriesPoint {
                timestamp,
                value: *value,
            })
            .collect()
    }

    #[tokio::test]
    async fn arithmetic_indexes_inputs_positionally_against_first_non_empty_input() {
        let registry = SourceRegistry::new("default");
        let executor = Executor::new(&registry, range());
        let mut ctx = ExecutionContext::new();
        ctx.register("E")
            .expect("register")
            .complete(Ok(NamedSeries::new("E", "value", range(), Vec::new())));
        ctx.register("A")
            .expect("register")
            .complete(Ok(NamedSeries::new(
                "A",
                "value",
                range(),
                points(&[Some(1.0), None, Some(3.0)]),
            )));
        ctx.register("B")
            .expect("register")
            .complete(Ok(NamedSeries::new(
                "B",
                "value",
                range(),
                points(&[Some(10.0)]),
            )));

        let query = validate_query(&QuerySpec {
            ref_id: "C".to_string(),
            query_type: Some("Arithmetic".to_string()),
            expression: Some("E + A + B".to_string()),
            ..Default::default()
        })
        .expect("valid");
        let series = executor.run(&query, &ctx).await.expect("series");

        assert_eq!(series.points.len(), 3);
        assert_eq!(series.values(), vec![Some(11.0), Some(0.0), Some(3.0)]);
        assert_eq!(series.degraded_samples, 0);
    }

    #[tokio::test]
    async fn mismatched_field_length_is_malformed() {
        let source = ScriptedSource::responder("default", |window, request| {
            Ok(series_result(
                &request.ref_id,
                minute_timestamps(window),
                vec![Some(1.0)],
            ))
        });
        let registry = registry_with(source);
        let executor = Executor::new(&registry, range());
        let err = executor
            .run(&moving_average(1), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream_query_error");
    }
}
