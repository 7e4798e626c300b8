//! Derived time-series queries federated over underlying series sources.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod graph;
pub mod types;

pub use dispatcher::{BatchResult, FederationService, PingStatus};
pub use error::{QueryError, QueryErrorBody};
pub use types::{NamedSeries, QuerySpec, SeriesPoint};
