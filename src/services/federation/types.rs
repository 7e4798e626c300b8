use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::QueryError;
use crate::services::expression::{compile_expression, CompiledExpression};
use crate::time::{TimeRange, TimeShiftUnit};

pub const DEFAULT_PERIODS: i64 = 7;
pub const DEFAULT_TIME_SHIFT_UNIT: TimeShiftUnit = TimeShiftUnit::Days;

/// A derived query as the host sends it: loosely typed, every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub periods: Option<i64>,
    #[serde(default)]
    pub timeshift_unit: Option<String>,
    /// Identifier of the underlying query a TimeShift / MovingAverage transforms.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub output_metric_name: Option<String>,
    #[serde(default)]
    pub hide: Option<bool>,
    /// Either a source name or an object carrying `uid` / `name`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub datasource: Option<serde_json::Value>,
}

impl QuerySpec {
    pub fn is_suppressed(&self) -> bool {
        self.hide.unwrap_or(false)
    }

    pub fn datasource_name(&self) -> Option<String> {
        match self.datasource.as_ref()? {
            serde_json::Value::String(name) => Some(name.clone()),
            serde_json::Value::Object(obj) => obj
                .get("uid")
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    TimeShift,
    MovingAverage,
    Arithmetic,
}

impl QueryType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "TimeShift" => Some(Self::TimeShift),
            "MovingAverage" => Some(Self::MovingAverage),
            "Arithmetic" => Some(Self::Arithmetic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeShift => "TimeShift",
            Self::MovingAverage => "MovingAverage",
            Self::Arithmetic => "Arithmetic",
        }
    }

    pub fn default_output_name(&self) -> &'static str {
        match self {
            Self::TimeShift => "timeshift",
            Self::MovingAverage => "moving_average",
            Self::Arithmetic => "arithmetic_result",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DerivedQueryKind {
    TimeShift {
        source_query_id: String,
        metric: Option<String>,
        periods: u32,
        unit: TimeShiftUnit,
    },
    MovingAverage {
        source_query_id: String,
        metric: Option<String>,
        periods: u32,
    },
    Arithmetic {
        expression: CompiledExpression,
    },
}

/// A validated derived query. Construction goes through [`validate_batch`].
#[derive(Debug, Clone)]
pub struct DerivedQuery {
    pub id: String,
    pub datasource: Option<String>,
    pub output_name: String,
    pub kind: DerivedQueryKind,
}

impl DerivedQuery {
    pub fn query_type(&self) -> QueryType {
        match self.kind {
            DerivedQueryKind::TimeShift { .. } => QueryType::TimeShift,
            DerivedQueryKind::MovingAverage { .. } => QueryType::MovingAverage,
            DerivedQueryKind::Arithmetic { .. } => QueryType::Arithmetic,
        }
    }

    /// Ids of other queries this one reads; only Arithmetic queries have any.
    pub fn references(&self) -> &[String] {
        match &self.kind {
            DerivedQueryKind::Arithmetic { expression } => expression.references(),
            _ => &[],
        }
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn validation(query_id: &str, message: impl Into<String>) -> QueryError {
    QueryError::Validation {
        query_id: Some(query_id.to_string()),
        message: message.into(),
    }
}

fn parse_periods(spec: &QuerySpec) -> Result<u32, QueryError> {
    let periods = spec.periods.unwrap_or(DEFAULT_PERIODS);
    if periods < 1 {
        return Err(validation(
            &spec.ref_id,
            format!("periods must be >= 1 (got {periods})"),
        ));
    }
    u32::try_from(periods).map_err(|_| {
        validation(
            &spec.ref_id,
            format!("periods {periods} is not representable as a shift count"),
        )
    })
}

fn require_source_query(spec: &QuerySpec, query_type: QueryType) -> Result<String, QueryError> {
    non_empty(spec.query.as_deref()).ok_or_else(|| {
        validation(
            &spec.ref_id,
            format!("{} query requires the underlying query id", query_type.as_str()),
        )
    })
}

pub fn validate_query(spec: &QuerySpec) -> Result<DerivedQuery, QueryError> {
    let id = spec.ref_id.trim().to_string();
    if id.is_empty() {
        return Err(QueryError::Validation {
            query_id: None,
            message: "query is missing refId".to_string(),
        });
    }

    let query_type = match spec.query_type.as_deref().map(str::trim) {
        None | Some("") => QueryType::TimeShift,
        Some(raw) => QueryType::parse(raw)
            .ok_or_else(|| validation(&id, format!("unknown query type \"{raw}\"")))?,
    };

    let kind = match query_type {
        QueryType::TimeShift => {
            let unit = match non_empty(spec.timeshift_unit.as_deref()) {
                None => DEFAULT_TIME_SHIFT_UNIT,
                Some(raw) => TimeShiftUnit::parse(&raw)
                    .ok_or_else(|| validation(&id, format!("unknown time shift unit \"{raw}\"")))?,
            };
            DerivedQueryKind::TimeShift {
                source_query_id: require_source_query(spec, query_type)?,
                metric: non_empty(spec.metric.as_deref()),
                periods: parse_periods(spec)?,
                unit,
            }
        }
        QueryType::MovingAverage => DerivedQueryKind::MovingAverage {
            source_query_id: require_source_query(spec, query_type)?,
            metric: non_empty(spec.metric.as_deref()),
            periods: parse_periods(spec)?,
        },
        QueryType::Arithmetic => {
            let raw = spec.expression.as_deref().unwrap_or("");
            let expression =
                compile_expression(raw).map_err(|err| validation(&id, err.to_string()))?;
            DerivedQueryKind::Arithmetic { expression }
        }
    };

    let output_name = non_empty(spec.output_metric_name.as_deref())
        .unwrap_or_else(|| query_type.default_output_name().to_string());

    Ok(DerivedQuery {
        id,
        datasource: spec.datasource_name(),
        output_name,
        kind,
    })
}

/// Validates every query of a batch; the first failure rejects the whole batch.
pub fn validate_batch(specs: &[QuerySpec]) -> Result<Vec<DerivedQuery>, QueryError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let query = validate_query(spec)?;
        if !seen.insert(query.id.clone()) {
            return Err(validation(
                &query.id,
                format!("duplicate refId \"{}\" in batch", query.id),
            ));
        }
        out.push(query);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, utoipa::ToSchema)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// One output series of a derived query.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedSeries {
    pub ref_id: String,
    pub name: String,
    pub range: TimeRange,
    pub points: Vec<SeriesPoint>,
    /// Samples that failed to evaluate and were reported as `0`.
    pub degraded_samples: usize,
}

impl NamedSeries {
    pub fn new(ref_id: &str, name: &str, range: TimeRange, points: Vec<SeriesPoint>) -> Self {
        Self {
            ref_id: ref_id.to_string(),
            name: name.to_string(),
            range,
            points,
            degraded_samples: 0,
        }
    }

    pub fn value_at(&self, idx: usize) -> Option<f64> {
        self.points.get(idx).and_then(|point| point.value)
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|point| point.value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> QuerySpec {
        serde_json::from_value(json).expect("spec")
    }

    #[test]
    fn applies_reference_defaults() {
        let query = validate_query(&spec(serde_json::json!({
            "refId": "B",
            "query": "A"
        })))
        .expect("valid");
        assert_eq!(query.output_name, "timeshift");
        match query.kind {
            DerivedQueryKind::TimeShift { periods, unit, .. } => {
                assert_eq!(periods, 7);
                assert_eq!(unit, TimeShiftUnit::Days);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type_and_non_positive_periods() {
        let err = validate_query(&spec(serde_json::json!({
            "refId": "B",
            "queryType": "Forecast"
        })))
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("Forecast"));

        let err = validate_query(&spec(serde_json::json!({
            "refId": "B",
            "queryType": "MovingAverage",
            "query": "A",
            "periods": 0
        })))
        .unwrap_err();
        assert!(err.to_string().contains("periods"));
    }

    #[test]
    fn accepts_large_period_counts() {
        let query = validate_query(&spec(serde_json::json!({
            "refId": "B",
            "query": "A",
            "periods": 1440,
            "timeshiftUnit": "minutes"
        })))
        .expect("valid");
        match query.kind {
            DerivedQueryKind::TimeShift { periods, unit, .. } => {
                assert_eq!(periods, 1440);
                assert_eq!(unit, TimeShiftUnit::Minutes);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn rejects_arithmetic_without_references() {
        let err = validate_query(&spec(serde_json::json!({
            "refId": "C",
            "queryType": "Arithmetic",
            "expression": "1 + 2"
        })))
        .unwrap_err();
        assert!(err.to_string().contains("No valid query references"));
    }

    #[test]
    fn reads_datasource_from_string_or_object() {
        let by_name = spec(serde_json::json!({ "refId": "A", "datasource": "influx" }));
        assert_eq!(by_name.datasource_name().as_deref(), Some("influx"));
        let by_uid = spec(serde_json::json!({ "refId": "A", "datasource": { "uid": "p1" } }));
        assert_eq!(by_uid.datasource_name().as_deref(), Some("p1"));
        let none = spec(serde_json::json!({ "refId": "A" }));
        assert_eq!(none.datasource_name(), None);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let specs = vec![
            spec(serde_json::json!({ "refId": "A", "query": "X" })),
            spec(serde_json::json!({ "refId": "A", "query": "Y" })),
        ];
        let err = validate_batch(&specs).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
