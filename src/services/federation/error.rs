use serde::Serialize;

use crate::services::sources::SourceError;

/// Serializable error record returned to callers, keyed by query id.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct QueryErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Unknown type, missing field, bad periods or an expression without references.
    Validation {
        query_id: Option<String>,
        message: String,
    },
    /// Arithmetic references form a cycle; found before anything runs.
    DependencyCycle { query_id: String, cycle: Vec<String> },
    /// A referenced id is not part of the (non-suppressed) batch.
    MissingDependency { query_id: String, dependency: String },
    /// A referenced query ran but failed itself.
    DependencyFailed { query_id: String, dependency: String },
    /// The underlying source failed or returned unusable data for one sub-request.
    Upstream {
        query_id: String,
        source_name: String,
        sub_request: String,
        cause: SourceError,
    },
    /// Unknown source, or a source that routes back into this layer.
    Configuration { query_id: String, message: String },
    /// A derived range cannot be represented.
    TimeRange { query_id: String, message: String },
    Cancelled,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation {
                query_id: Some(id),
                message,
            } => write!(f, "Invalid query {id}: {message}"),
            Self::Validation {
                query_id: None,
                message,
            } => write!(f, "Invalid query: {message}"),
            Self::DependencyCycle { query_id, cycle } => write!(
                f,
                "Cycle detected in query {}: {}",
                query_id,
                cycle.join(" -> ")
            ),
            Self::MissingDependency {
                query_id,
                dependency,
            } => write!(
                f,
                "Query {query_id} references {dependency}, which is not part of the batch"
            ),
            Self::DependencyFailed {
                query_id,
                dependency,
            } => write!(f, "Query {query_id} depends on {dependency}, which failed"),
            Self::Upstream {
                query_id,
                source_name,
                sub_request,
                cause,
            } => write!(
                f,
                "Query {query_id} failed on source {source_name} ({sub_request}): {cause}"
            ),
            Self::Configuration { query_id, message } => {
                write!(f, "Query {query_id} is misconfigured: {message}")
            }
            Self::TimeRange { query_id, message } => {
                write!(f, "Query {query_id} has an invalid time range: {message}")
            }
            Self::Cancelled => write!(f, "Query batch was cancelled"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::Upstream { .. } => "upstream_query_error",
            Self::Configuration { .. } => "configuration_error",
            Self::TimeRange { .. } => "time_range_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Errors that abort the whole batch rather than one query.
    pub fn is_batch_level(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::DependencyCycle { .. } | Self::Cancelled
        )
    }

    pub fn to_api_error(&self) -> QueryErrorBody {
        let details = match self {
            Self::Validation { query_id, .. } => {
                query_id.as_ref().map(|id| serde_json::json!({ "query_id": id }))
            }
            Self::DependencyCycle { query_id, cycle } => Some(serde_json::json!({
                "query_id": query_id,
                "cycle": cycle
            })),
            Self::MissingDependency {
                query_id,
                dependency,
            }
            | Self::DependencyFailed {
                query_id,
                dependency,
            } => Some(serde_json::json!({
                "query_id": query_id,
                "dependency": dependency
            })),
            Self::Upstream {
                query_id,
                source_name,
                sub_request,
                cause,
            } => Some(serde_json::json!({
                "query_id": query_id,
                "source": source_name,
                "sub_request": sub_request,
                "cause": cause.to_string()
            })),
            Self::Configuration { query_id, .. } | Self::TimeRange { query_id, .. } => {
                Some(serde_json::json!({ "query_id": query_id }))
            }
            Self::Cancelled => None,
        };
        QueryErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}
