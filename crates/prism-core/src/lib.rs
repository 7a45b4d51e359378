//! # prism-core — The Model of PRISM
//!
//! Everything the engine agrees on before any data moves: the declarative
//! [`QueryRequest`], the compiled [`QueryPlan`] DAG, the [`QueryExecution`]
//! record and its lifecycle, and the [`PlanCompiler`] that turns the first
//! into the second.
//!
//! This crate performs no I/O. Source adapters, federation, execution and
//! caching live in `prism-hub`.

pub mod catalog;
pub mod compiler;
pub mod error;
pub mod execution;
pub mod hash;
pub mod model;
pub mod plan;
pub mod source;

pub use catalog::{DataSufficiency, PlannerCatalog, StaticCatalog, SufficiencyThresholds};
pub use compiler::{score_type_for, CompilerOptions, PlanCompiler};
pub use error::{QueryError, QueryResult};
pub use execution::{
    ExecutionError, ExecutionStatus, NodeExecution, NodeStatus, QueryExecution, TransitionError,
};
pub use model::{
    OutputFormat, QueryConstraints, QueryKind, QueryRequest, SamplingMode, SamplingPolicy,
    TimeWindow,
};
pub use plan::{
    AggregateConfig, ExecutionMode, FederationMode, MergeStrategy, NodeConfig, NodeId, NodeType,
    OutputConfig, Params, PlanSummary, QueryNode, QueryPlan, ScoreConfig, ScoreType, SourceConfig,
    TransformConfig,
};
pub use source::{Capability, DataSourceInfo, PerformanceMetrics, Record, SourceType};
