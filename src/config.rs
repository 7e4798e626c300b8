use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/metaqueries/config.json";
const DEFAULT_SOURCE_NAME: &str = "default";
const DEFAULT_SOURCE_CAPABILITY: &str = "series-source";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

pub(crate) fn setup_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("METAQ_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// One named underlying source reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_capability")]
    pub capability_id: String,
}

fn default_capability() -> String {
    DEFAULT_SOURCE_CAPABILITY.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    default_source: Option<String>,
    #[serde(default)]
    default_source_url: Option<String>,
    #[serde(default)]
    default_source_capability: Option<String>,
    #[serde(default)]
    upstream_timeout_ms: Option<u64>,
    #[serde(default)]
    sources: Option<Vec<SourceConfig>>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Source used when a query names none (or a placeholder).
    pub default_source: String,
    pub default_source_url: Option<String>,
    pub default_source_capability: String,
    pub sources: Vec<SourceConfig>,
    pub upstream_timeout_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            default_source: DEFAULT_SOURCE_NAME.to_string(),
            default_source_url: None,
            default_source_capability: DEFAULT_SOURCE_CAPABILITY.to_string(),
            sources: Vec::new(),
            upstream_timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
        }
    }
}

/// Fields explicitly set in the environment; the setup file never overrides these.
#[derive(Debug, Clone, Copy, Default)]
struct EnvPresence {
    default_source: bool,
    default_source_url: bool,
    default_source_capability: bool,
    upstream_timeout_ms: bool,
    sources: bool,
}

impl FederationConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            default_source: env_string("METAQ_DEFAULT_SOURCE", DEFAULT_SOURCE_NAME),
            default_source_url: env_optional_string("METAQ_DEFAULT_SOURCE_URL"),
            default_source_capability: env_string(
                "METAQ_DEFAULT_SOURCE_CAPABILITY",
                DEFAULT_SOURCE_CAPABILITY,
            ),
            sources: match env_optional_string("METAQ_SOURCES") {
                Some(raw) => parse_source_list(&raw).context("invalid METAQ_SOURCES")?,
                None => Vec::new(),
            },
            upstream_timeout_ms: env_u64("METAQ_UPSTREAM_TIMEOUT_MS", DEFAULT_UPSTREAM_TIMEOUT_MS),
        };

        let presence = EnvPresence {
            default_source: env_is_set("METAQ_DEFAULT_SOURCE"),
            default_source_url: env_is_set("METAQ_DEFAULT_SOURCE_URL"),
            default_source_capability: env_is_set("METAQ_DEFAULT_SOURCE_CAPABILITY"),
            upstream_timeout_ms: env_is_set("METAQ_UPSTREAM_TIMEOUT_MS"),
            sources: env_is_set("METAQ_SOURCES"),
        };
        if let Some(overrides) = load_setup_config_overrides(&setup_config_path()) {
            apply_setup_overrides(&mut config, &overrides, presence);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_source.trim().is_empty() {
            anyhow::bail!("default source name must not be empty");
        }
        if self.upstream_timeout_ms == 0 {
            anyhow::bail!("upstream timeout must be greater than zero");
        }
        if let Some(url) = self.default_source_url.as_deref() {
            reqwest::Url::parse(url)
                .with_context(|| format!("invalid default source url {url}"))?;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        if self.default_source_url.is_some() {
            seen.insert(self.default_source.as_str());
        }
        for source in &self.sources {
            if source.name.trim().is_empty() {
                anyhow::bail!("configured source with url {} has no name", source.url);
            }
            if !seen.insert(source.name.as_str()) {
                anyhow::bail!("source {} is configured more than once", source.name);
            }
            reqwest::Url::parse(&source.url)
                .with_context(|| format!("invalid url for source {}", source.name))?;
        }
        Ok(())
    }
}

fn apply_setup_overrides(
    config: &mut FederationConfig,
    overrides: &SetupConfigOverrides,
    presence: EnvPresence,
) {
    if !presence.default_source {
        if let Some(name) = overrides
            .default_source
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.default_source = name.to_string();
        }
    }
    if !presence.default_source_url {
        if let Some(url) = overrides
            .default_source_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.default_source_url = Some(url.to_string());
        }
    }
    if !presence.default_source_capability {
        if let Some(capability) = overrides
            .default_source_capability
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.default_source_capability = capability.to_string();
        }
    }
    if !presence.upstream_timeout_ms {
        if let Some(timeout) = overrides.upstream_timeout_ms.filter(|v| *v > 0) {
            config.upstream_timeout_ms = timeout;
        }
    }
    if !presence.sources {
        if let Some(sources) = overrides.sources.as_ref() {
            config.sources = sources
                .iter()
                .map(|source| SourceConfig {
                    name: source.name.trim().to_string(),
                    url: source.url.trim().to_string(),
                    capability_id: source.capability_id.trim().to_string(),
                })
                .collect();
        }
    }
}

/// Parses `name=url` pairs separated by commas, e.g. `influx=http://influx:8086,prom=http://prom:9090`.
fn parse_source_list(raw: &str) -> Result<Vec<SourceConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<SourceConfig> {
            let (name, url) = entry
                .split_once('=')
                .with_context(|| format!("expected name=url, got {entry}"))?;
            let name = name.trim();
            let url = url.trim();
            if name.is_empty() || url.is_empty() {
                anyhow::bail!("expected name=url, got {entry}");
            }
            Ok(SourceConfig {
                name: name.to_string(),
                url: url.to_string(),
                capability_id: default_capability(),
            })
        })
        .collect()
}

fn env_is_set(key: &str) -> bool {
    env_optional_string(key).is_some()
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
