//! # Execution Records
//!
//! One [`QueryExecution`] per plan run. The executor is its only writer;
//! once the status is terminal the record is frozen and every further
//! mutation is refused.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::QueryError;
use crate::plan::{NodeId, NodeType, QueryPlan};

/// Lifecycle: PENDING → COMPILING → QUEUED → RUNNING → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Compiling,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Latency ceiling breached. Distinct from FAILED.
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Compiling) | (Compiling, Queued) | (Queued, Running) => true,
            (Running, Completed) | (Running, Timeout) => true,
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal execution transition {from:?} -> {to:?}")]
    Illegal {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("execution is terminal ({0:?}) and can no longer be modified")]
    Frozen(ExecutionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Completed,
    Failed,
}

/// Immutable trail entry for one node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub label: String,
    pub status: NodeStatus,
    pub started_at_ms: i64,
    pub latency_ms: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Structured error attached to a FAILED or TIMEOUT execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
}

impl From<&QueryError> for ExecutionError {
    fn from(err: &QueryError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    pub id: String,
    pub plan: QueryPlan,
    pub status: ExecutionStatus,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub node_executions: Vec<NodeExecution>,
    pub result: Option<Value>,
    pub error: Option<ExecutionError>,
    /// Partial-capability signals (passthrough operators, low confidence).
    pub warnings: Vec<String>,
}

impl QueryExecution {
    pub fn new(id: impl Into<String>, plan: QueryPlan, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            plan,
            status: ExecutionStatus::Pending,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            node_executions: Vec::new(),
            result: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(
        &mut self,
        next: ExecutionStatus,
        now_ms: i64,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Frozen(self.status));
        }
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == ExecutionStatus::Running {
            self.started_at_ms = Some(now_ms);
        }
        if next.is_terminal() {
            self.completed_at_ms = Some(now_ms);
        }
        Ok(())
    }

    /// Walk PENDING → COMPILING → QUEUED → RUNNING. The first two hops are
    /// instantaneous today; admission control can hold a plan in QUEUED.
    pub fn start(&mut self, now_ms: i64) -> Result<(), TransitionError> {
        for next in [
            ExecutionStatus::Compiling,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
        ] {
            if self.status != next {
                self.transition(next, now_ms)?;
            }
        }
        Ok(())
    }

    pub fn record_node(&mut self, record: NodeExecution) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Frozen(self.status));
        }
        self.node_executions.push(record);
        Ok(())
    }

    pub fn warn(&mut self, warning: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Frozen(self.status));
        }
        self.warnings.push(warning.into());
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now_ms: i64) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Completed, now_ms)?;
        self.result = Some(result);
        Ok(())
    }

    /// Terminate with FAILED, or TIMEOUT for latency breaches.
    pub fn fail(&mut self, err: &QueryError, now_ms: i64) -> Result<(), TransitionError> {
        let next = match err {
            QueryError::Timeout { .. } => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Failed,
        };
        self.transition(next, now_ms)?;
        self.error = Some(ExecutionError::from(err));
        Ok(())
    }

    pub fn latency_ms(&self) -> Option<i64> {
        Some(self.completed_at_ms? - self.started_at_ms?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ExecutionMode;

    fn empty_plan() -> QueryPlan {
        QueryPlan {
            id: "plan-test".into(),
            nodes: Vec::new(),
            mode: ExecutionMode::Sequential,
            max_latency_ms: None,
            min_confidence: None,
            max_cost: None,
            estimated_cost: 0.0,
            reproducibility_hash: String::new(),
            config_version: "test".into(),
        }
    }

    #[test]
    fn test_start_walks_to_running() {
        let mut exec = QueryExecution::new("exec-1", empty_plan(), 10);
        exec.start(20).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.started_at_ms, Some(20));
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut exec = QueryExecution::new("exec-1", empty_plan(), 0);
        assert_eq!(
            exec.transition(ExecutionStatus::Completed, 1),
            Err(TransitionError::Illegal {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Completed,
            })
        );
    }

    #[test]
    fn test_terminal_execution_is_frozen() {
        let mut exec = QueryExecution::new("exec-1", empty_plan(), 0);
        exec.start(1).unwrap();
        exec.complete(serde_json::json!({"score": 1.0}), 5).unwrap();
        assert_eq!(exec.latency_ms(), Some(4));

        assert!(matches!(
            exec.transition(ExecutionStatus::Failed, 6),
            Err(TransitionError::Frozen(ExecutionStatus::Completed))
        ));
        assert!(exec.warn("late").is_err());
        assert!(exec.warnings.is_empty());
    }

    #[test]
    fn test_timeout_error_maps_to_timeout_status() {
        let mut exec = QueryExecution::new("exec-1", empty_plan(), 0);
        exec.start(0).unwrap();
        exec.fail(
            &QueryError::Timeout {
                elapsed_ms: 30,
                limit_ms: 10,
            },
            30,
        )
        .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Timeout);
        assert_eq!(exec.error.as_ref().unwrap().kind, "Timeout");
    }

    #[test]
    fn test_failure_allowed_before_running() {
        let mut exec = QueryExecution::new("exec-1", empty_plan(), 0);
        exec.fail(&QueryError::CyclicPlan { unresolved: 2 }, 1)
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
    }
}
