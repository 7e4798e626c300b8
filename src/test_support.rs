use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::services::federation::FederationService;
use crate::services::sources::{
    NumericField, SeriesRequest, SeriesResult, SeriesSource, SourceError, SourceRegistry,
};
use crate::state::AppState;
use crate::time::TimeRange;

pub type RecordedCalls = Arc<Mutex<Vec<(TimeRange, Vec<SeriesRequest>)>>>;

type Responder =
    Arc<dyn Fn(TimeRange, &SeriesRequest) -> Result<SeriesResult, SourceError> + Send + Sync>;

/// Ambient display range used by tests: three one-minute samples.
pub fn range() -> TimeRange {
    let from = Utc
        .with_ymd_and_hms(2026, 1, 8, 0, 0, 0)
        .single()
        .expect("from");
    TimeRange::new(from, from + Duration::minutes(3)).expect("range")
}

/// One timestamp per minute in `[from, to)`.
pub fn minute_timestamps(range: TimeRange) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut ts = range.from;
    while ts < range.to {
        out.push(ts);
        ts += Duration::minutes(1);
    }
    out
}

pub fn series_result(
    ref_id: &str,
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<Option<f64>>,
) -> SeriesResult {
    SeriesResult {
        ref_id: ref_id.to_string(),
        timestamps,
        fields: vec![NumericField {
            name: "value".to_string(),
            values,
        }],
    }
}

/// In-memory series source that records every call.
#[derive(Clone)]
pub struct ScriptedSource {
    name: String,
    capability_id: String,
    responder: Option<Responder>,
    calls: RecordedCalls,
}

impl ScriptedSource {
    pub fn responder<F>(name: &str, responder: F) -> Self
    where
        F: Fn(TimeRange, &SeriesRequest) -> Result<SeriesResult, SourceError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            capability_id: "series-source".to_string(),
            responder: Some(Arc::new(responder)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers every request with `value` once per minute of the requested range.
    pub fn constant(name: &str, value: f64) -> Self {
        Self::responder(name, move |window, request| {
            let timestamps = minute_timestamps(window);
            let values = vec![Some(value); timestamps.len()];
            Ok(series_result(&request.ref_id, timestamps, values))
        })
    }

    pub fn failing(name: &str, error: SourceError) -> Self {
        Self::responder(name, move |_, _| Err(error.clone()))
    }

    /// Records the call and never answers.
    pub fn stalling(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capability_id: "series-source".to_string(),
            responder: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_capability(mut self, capability_id: &str) -> Self {
        self.capability_id = capability_id.to_string();
        self
    }

    pub fn calls(&self) -> RecordedCalls {
        self.calls.clone()
    }
}

impl SeriesSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability_id(&self) -> &str {
        &self.capability_id
    }

    fn query(
        &self,
        range: TimeRange,
        requests: Vec<SeriesRequest>,
    ) -> BoxFuture<'_, Result<Vec<SeriesResult>, SourceError>> {
        self.calls
            .lock()
            .expect("calls")
            .push((range, requests.clone()));
        let responder = self.responder.clone();
        async move {
            let Some(responder) = responder else {
                futures::future::pending::<()>().await;
                return Ok(Vec::new());
            };
            requests
                .iter()
                .map(|request| responder(range, request))
                .collect()
        }
        .boxed()
    }
}

pub fn test_registry(source: ScriptedSource) -> SourceRegistry {
    let mut registry = SourceRegistry::new(source.name.clone());
    registry.register(Arc::new(source));
    registry
}

pub fn test_state(source: ScriptedSource) -> AppState {
    AppState {
        federation: Arc::new(FederationService::new(Arc::new(test_registry(source)))),
        shutdown: CancellationToken::new(),
    }
}
