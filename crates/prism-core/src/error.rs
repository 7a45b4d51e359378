//! # Error Taxonomy
//!
//! Every failure that crosses the engine boundary is one of these kinds.

use thiserror::Error;

use crate::source::SourceType;

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// Missing or malformed request fields. Raised before compilation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The plan's dependency relation has no topological order.
    #[error("plan contains a dependency cycle ({unresolved} nodes unresolved)")]
    CyclicPlan { unresolved: usize },

    /// A SOURCE node names a source type with no registered adapter.
    #[error("no adapter registered for data source '{0}'")]
    UnknownDataSource(SourceType),

    /// A federated fetch where no adapter succeeded.
    #[error("all {attempted} data sources failed: {}", .errors.join("; "))]
    AllSourcesFailed {
        attempted: usize,
        errors: Vec<String>,
    },

    /// A partial-results fetch that fell below its success floor.
    #[error(
        "insufficient data sources: {succeeded} succeeded, {failed} failed, {required} required"
    )]
    InsufficientSources {
        succeeded: usize,
        failed: usize,
        required: usize,
    },

    /// A TRANSFORM/AGGREGATE/SCORE/OUTPUT implementation raised an error.
    #[error("node {node_id} failed: {message}")]
    NodeExecutionFailed { node_id: String, message: String },

    /// The plan's latency ceiling was breached.
    #[error("execution exceeded its latency ceiling ({elapsed_ms}ms > {limit_ms}ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },
}

impl QueryError {
    /// Stable machine-readable kind, used at the API boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::CyclicPlan { .. } => "CyclicPlan",
            Self::UnknownDataSource(_) => "UnknownDataSource",
            Self::AllSourcesFailed { .. } => "AllSourcesFailed",
            Self::InsufficientSources { .. } => "InsufficientSources",
            Self::NodeExecutionFailed { .. } => "NodeExecutionFailed",
            Self::Timeout { .. } => "Timeout",
        }
    }
}
