//! # Execution Store
//!
//! Bounded in-memory history of terminal [`QueryExecution`]s, newest first,
//! with an optional append-only trace journal. Each stored execution writes
//! one execution line plus one line per node execution as a single batch on
//! the blocking pool; nothing is ever rewritten.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use prism_core::{ExecutionError, ExecutionStatus, NodeExecution, QueryExecution};
use prism_io::{JournalError, ReplayReport, TraceJournal};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TraceRecord {
    Execution {
        execution_id: String,
        plan_id: String,
        reproducibility_hash: String,
        status: ExecutionStatus,
        created_at_ms: i64,
        started_at_ms: Option<i64>,
        completed_at_ms: Option<i64>,
        node_count: usize,
        error: Option<ExecutionError>,
        warnings: Vec<String>,
    },
    Node {
        execution_id: String,
        node: NodeExecution,
    },
}

impl TraceRecord {
    fn from_execution(execution: &QueryExecution) -> Vec<TraceRecord> {
        let mut records = Vec::with_capacity(1 + execution.node_executions.len());
        records.push(TraceRecord::Execution {
            execution_id: execution.id.clone(),
            plan_id: execution.plan.id.clone(),
            reproducibility_hash: execution.plan.reproducibility_hash.clone(),
            status: execution.status,
            created_at_ms: execution.created_at_ms,
            started_at_ms: execution.started_at_ms,
            completed_at_ms: execution.completed_at_ms,
            node_count: execution.node_executions.len(),
            error: execution.error.clone(),
            warnings: execution.warnings.clone(),
        });
        records.extend(execution.node_executions.iter().map(|node| TraceRecord::Node {
            execution_id: execution.id.clone(),
            node: node.clone(),
        }));
        records
    }
}

/// Compact row for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: String,
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub created_at_ms: i64,
    pub latency_ms: Option<i64>,
    pub node_count: usize,
    pub error_kind: Option<String>,
}

impl From<&QueryExecution> for ExecutionSummary {
    fn from(execution: &QueryExecution) -> Self {
        Self {
            id: execution.id.clone(),
            plan_id: execution.plan.id.clone(),
            status: execution.status,
            created_at_ms: execution.created_at_ms,
            latency_ms: execution.latency_ms(),
            node_count: execution.node_executions.len(),
            error_kind: execution.error.as_ref().map(|e| e.kind.clone()),
        }
    }
}

#[derive(Default)]
struct History {
    by_id: HashMap<String, Arc<QueryExecution>>,
    order: VecDeque<String>,
}

pub struct ExecutionStore {
    history: RwLock<History>,
    capacity: usize,
    journal: Option<Arc<Mutex<TraceJournal>>>,
    journal_path: Option<PathBuf>,
}

impl ExecutionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RwLock::new(History::default()),
            capacity: capacity.max(1),
            journal: None,
            journal_path: None,
        }
    }

    pub fn with_journal(mut self, path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let journal = TraceJournal::open(path)?;
        tracing::info!("Trace journal at {}", journal.path().display());
        self.journal_path = Some(journal.path().to_path_buf());
        self.journal = Some(Arc::new(Mutex::new(journal)));
        Ok(self)
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// Store a terminal execution and journal its trace.
    pub async fn insert(&self, execution: QueryExecution) -> Arc<QueryExecution> {
        if !execution.is_terminal() {
            tracing::warn!(
                "Storing non-terminal execution '{}' ({:?})",
                execution.id,
                execution.status
            );
        }
        self.append_trace(&execution).await;

        let execution = Arc::new(execution);
        let mut history = self.history.write().await;
        if history
            .by_id
            .insert(execution.id.clone(), execution.clone())
            .is_none()
        {
            history.order.push_back(execution.id.clone());
        }
        while history.order.len() > self.capacity {
            if let Some(oldest) = history.order.pop_front() {
                history.by_id.remove(&oldest);
            }
        }
        execution
    }

    pub async fn get(&self, id: &str) -> Option<Arc<QueryExecution>> {
        self.history.read().await.by_id.get(id).cloned()
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Vec<ExecutionSummary> {
        let history = self.history.read().await;
        history
            .order
            .iter()
            .rev()
            .filter_map(|id| history.by_id.get(id))
            .take(limit)
            .map(|execution| ExecutionSummary::from(execution.as_ref()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.by_id.len()
    }

    pub fn replay_journal(path: impl AsRef<Path>) -> Result<ReplayReport<TraceRecord>, JournalError> {
        TraceJournal::replay(path)
    }

    async fn append_trace(&self, execution: &QueryExecution) {
        let Some(journal) = &self.journal else {
            return;
        };
        let journal = journal.clone();
        let records = TraceRecord::from_execution(execution);
        let written = tokio::task::spawn_blocking(move || {
            let mut journal = journal.lock().unwrap_or_else(|e| e.into_inner());
            journal.append_batch(&records)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to journal execution '{}': {}", execution.id, e),
            Err(e) => tracing::warn!("Journal writer for execution '{}' aborted: {}", execution.id, e),
        }
    }
}
