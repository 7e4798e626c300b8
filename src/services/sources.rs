use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FederationConfig;
use crate::time::TimeRange;

/// Capability id this federation layer declares. A configured source declaring the same id
/// would route derived queries back into this layer.
pub const FEDERATION_CAPABILITY_ID: &str = "metaqueries-datasource";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRequest {
    /// Result identifier echoed back in the matching [`SeriesResult`].
    pub ref_id: String,
    /// Source-specific reference to the underlying query.
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct NumericField {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResult {
    pub ref_id: String,
    #[serde(default)]
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Vec<NumericField>,
}

impl SeriesResult {
    /// The field named `metric` when present, otherwise the first numeric field.
    pub fn value_field(&self, metric: Option<&str>) -> Option<&NumericField> {
        metric
            .and_then(|metric| self.fields.iter().find(|field| field.name == metric))
            .or_else(|| self.fields.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    Transport(String),
    Status { status: u16, body: String },
    Decode(String),
    Malformed(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "request failed: {msg}"),
            Self::Status { status, body } => write!(f, "source returned {status}: {body}"),
            Self::Decode(msg) => write!(f, "failed to decode source response: {msg}"),
            Self::Malformed(msg) => write!(f, "source returned malformed data: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// The underlying time-series provider.
pub trait SeriesSource: Send + Sync {
    fn name(&self) -> &str;

    fn capability_id(&self) -> &str;

    fn query(
        &self,
        range: TimeRange,
        requests: Vec<SeriesRequest>,
    ) -> BoxFuture<'_, Result<Vec<SeriesResult>, SourceError>>;
}

#[derive(Debug, Serialize)]
struct SourceQueryBody<'a> {
    range: TimeRange,
    requests: &'a [SeriesRequest],
}

#[derive(Debug, Deserialize)]
struct SourceQueryResponse {
    #[serde(default)]
    results: Vec<SeriesResult>,
}

/// Series source reached over HTTP: `POST {base_url}/query`.
#[derive(Clone)]
pub struct HttpSeriesSource {
    name: String,
    capability_id: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpSeriesSource {
    pub fn new(
        name: impl Into<String>,
        capability_id: impl Into<String>,
        base_url: &str,
        timeout: Duration,
        http: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            capability_id: capability_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            http,
        }
    }

    async fn post_query(
        &self,
        range: TimeRange,
        requests: Vec<SeriesRequest>,
    ) -> Result<Vec<SeriesResult>, SourceError> {
        let url = format!("{}/query", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&SourceQueryBody {
                range,
                requests: &requests,
            })
            .send()
            .await
            .map_err(|err| SourceError::Transport(format!("{url}: {err}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: SourceQueryResponse = resp
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        Ok(body.results)
    }
}

impl SeriesSource for HttpSeriesSource {
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
        self.post_query(range, requests).boxed()
    }
}

/// Source names the host sends when no explicit source was chosen.
pub fn is_placeholder_source(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("undefined")
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.eq_ignore_ascii_case("default")
}

#[derive(Clone)]
pub struct SourceRegistry {
    default_source: String,
    sources: HashMap<String, Arc<dyn SeriesSource>>,
}

impl SourceRegistry {
    pub fn new(default_source: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
            sources: HashMap::new(),
        }
    }

    pub fn from_config(config: &FederationConfig, http: reqwest::Client) -> Self {
        let mut registry = Self::new(config.default_source.clone());
        let timeout = Duration::from_millis(config.upstream_timeout_ms);
        if let Some(url) = config.default_source_url.as_deref() {
            registry.register(Arc::new(HttpSeriesSource::new(
                config.default_source.clone(),
                config.default_source_capability.clone(),
                url,
                timeout,
                http.clone(),
            )));
        }
        for source in &config.sources {
            registry.register(Arc::new(HttpSeriesSource::new(
                source.name.clone(),
                source.capability_id.clone(),
                &source.url,
                timeout,
                http.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, source: Arc<dyn SeriesSource>) {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), source).is_some() {
            tracing::warn!(source = %name, "series source registered twice; keeping the latest");
        }
    }

    pub fn default_source(&self) -> &str {
        &self.default_source
    }

    /// Maps a requested source name onto a registry key; placeholders resolve to the default.
    pub fn resolve_name(&self, requested: Option<&str>) -> String {
        match requested {
            Some(name) if !is_placeholder_source(name) => name.trim().to_string(),
            _ => self.default_source.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SeriesSource>> {
        self.sources.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
