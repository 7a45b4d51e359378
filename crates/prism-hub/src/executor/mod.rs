//! # DAG Executor
//!
//! Runs a compiled [`QueryPlan`] and produces a terminal [`QueryExecution`].
//!
//! Nodes run once all their dependencies have completed. In `sequential`
//! mode one node runs at a time in topological order; `parallel` and
//! `adaptive` dispatch every ready node at once and poll them together on
//! the caller's task.
//!
//! Failure isolation: the first node error stops scheduling, in-flight nodes
//! are drained and recorded, and nothing downstream of the failure ever
//! starts. A `max_latency_ms` breach cancels the execution's
//! [`CancellationToken`] (adapters that honor it abort their I/O) and ends
//! the execution in TIMEOUT.

pub mod operators;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use prism_core::{
    ExecutionMode, NodeConfig, NodeExecution, NodeStatus, QueryError, QueryExecution, QueryNode,
    QueryPlan, QueryResult, SufficiencyThresholds, TransitionError,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::federation::FederatedFetchCoordinator;

/// Arrays longer than this are summarized in node-execution snapshots.
const SNAPSHOT_LIMIT: usize = 20;

/// A failed execution as seen by callers: the error plus the id of the
/// execution record, when one was created.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    pub error: QueryError,
    pub execution_id: Option<String>,
}

impl From<QueryError> for ExecutionFailure {
    fn from(error: QueryError) -> Self {
        Self {
            error,
            execution_id: None,
        }
    }
}

/// Terminal execution record plus the error that ended it, if any.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution: QueryExecution,
    pub failure: Option<QueryError>,
    pub records_fetched: usize,
}

struct NodeOutput {
    value: Value,
    snapshot: Option<Value>,
    warnings: Vec<String>,
    records_fetched: usize,
}

impl NodeOutput {
    fn plain(value: Value) -> Self {
        Self {
            value,
            snapshot: None,
            warnings: Vec::new(),
            records_fetched: 0,
        }
    }
}

struct NodeRun {
    idx: usize,
    started_at_ms: i64,
    latency_ms: u64,
    result: QueryResult<NodeOutput>,
}

pub struct DagExecutor {
    coordinator: Arc<FederatedFetchCoordinator>,
    thresholds: SufficiencyThresholds,
}

impl DagExecutor {
    pub fn new(coordinator: Arc<FederatedFetchCoordinator>, thresholds: SufficiencyThresholds) -> Self {
        Self {
            coordinator,
            thresholds,
        }
    }

    /// Execute a plan to a terminal state.
    ///
    /// Structural problems (duplicate ids, dangling dependencies, cycles)
    /// come back as `Err` before any execution record exists. Everything
    /// that goes wrong afterwards is reported through
    /// [`ExecutionOutcome::failure`] alongside the terminal record.
    pub async fn execute(&self, plan: QueryPlan) -> QueryResult<ExecutionOutcome> {
        let order = plan.topological_order()?;

        let id = format!("exec-{}", uuid::Uuid::new_v4().as_simple());
        let mut execution = QueryExecution::new(id, plan.clone(), crate::now_ms());
        execution.start(crate::now_ms()).map_err(transition_failed)?;
        tracing::info!(
            "Execution '{}' started: plan '{}' ({} nodes, {:?})",
            execution.id,
            plan.id,
            plan.nodes.len(),
            plan.mode
        );

        let positions: HashMap<&str, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id.as_str(), idx))
            .collect();
        let deps: Vec<Vec<usize>> = plan
            .nodes
            .iter()
            .map(|node| {
                let mut seen = HashSet::new();
                node.dependencies
                    .iter()
                    .filter_map(|d| positions.get(d.as_str()).copied())
                    .filter(|idx| seen.insert(*idx))
                    .collect()
            })
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.nodes.len()];
        for (idx, node_deps) in deps.iter().enumerate() {
            for dep in node_deps {
                dependents[*dep].push(idx);
            }
        }
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();

        // Ready nodes are kept in topological order so sequential runs are
        // deterministic.
        let rank: Vec<usize> = {
            let mut rank = vec![0; plan.nodes.len()];
            for (r, idx) in order.iter().enumerate() {
                rank[*idx] = r;
            }
            rank
        };
        let mut ready: VecDeque<usize> = order
            .iter()
            .copied()
            .filter(|idx| pending[*idx] == 0)
            .collect();

        let cancel = CancellationToken::new();
        let clock = Instant::now();
        let deadline = plan
            .max_latency_ms
            .map(|ms| clock + Duration::from_millis(ms));
        let sequential = plan.mode == ExecutionMode::Sequential;

        let mut outputs: HashMap<usize, Value> = HashMap::new();
        let mut failure: Option<QueryError> = None;
        let mut records_fetched = 0usize;
        let mut in_flight = FuturesUnordered::new();

        loop {
            // Nodes that finish on their first poll never let the sleep arm
            // run, so the ceiling is also checked between completions.
            if failure.is_none() && deadline.is_some_and(|d| Instant::now() >= d) {
                failure = Some(breach(&cancel, clock, plan.max_latency_ms, &execution.id));
            }
            while failure.is_none() && (!sequential || in_flight.is_empty()) {
                let Some(idx) = ready.pop_front() else {
                    break;
                };
                let input = gather_input(&deps[idx], &outputs);
                in_flight.push(self.run_node(idx, &plan.nodes[idx], input, plan.min_confidence, &cancel));
            }
            if in_flight.is_empty() {
                break;
            }

            let watching = failure.is_none();
            let next = match deadline {
                Some(deadline) if watching => tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => {
                        failure = Some(breach(&cancel, clock, plan.max_latency_ms, &execution.id));
                        continue;
                    }
                    run = in_flight.next() => run,
                },
                _ => in_flight.next().await,
            };
            let Some(run) = next else {
                break;
            };

            let node = &plan.nodes[run.idx];
            tracing::debug!(
                "Node '{}' ({}) finished in {}ms",
                node.id,
                node.node_type(),
                run.latency_ms
            );
            match run.result {
                Ok(output) => {
                    records_fetched += output.records_fetched;
                    for warning in output.warnings {
                        tracing::warn!("Execution '{}': {}", execution.id, warning);
                        execution.warn(warning).map_err(transition_failed)?;
                    }
                    execution
                        .record_node(NodeExecution {
                            node_id: node.id.clone(),
                            node_type: node.node_type(),
                            label: node.config.label(),
                            status: NodeStatus::Completed,
                            started_at_ms: run.started_at_ms,
                            latency_ms: run.latency_ms,
                            output: Some(output.snapshot.unwrap_or_else(|| snapshot(&output.value))),
                            error: None,
                        })
                        .map_err(transition_failed)?;
                    outputs.insert(run.idx, output.value);

                    let mut unlocked: Vec<usize> = Vec::new();
                    for next in &dependents[run.idx] {
                        pending[*next] -= 1;
                        if pending[*next] == 0 {
                            unlocked.push(*next);
                        }
                    }
                    ready.extend(unlocked);
                    ready.make_contiguous().sort_by_key(|idx| rank[*idx]);
                }
                Err(err) => {
                    execution
                        .record_node(NodeExecution {
                            node_id: node.id.clone(),
                            node_type: node.node_type(),
                            label: node.config.label(),
                            status: NodeStatus::Failed,
                            started_at_ms: run.started_at_ms,
                            latency_ms: run.latency_ms,
                            output: None,
                            error: Some(err.to_string()),
                        })
                        .map_err(transition_failed)?;
                    if failure.is_none() {
                        tracing::warn!(
                            "Execution '{}' node '{}' failed: {}",
                            execution.id,
                            node.id,
                            err
                        );
                        failure = Some(err);
                    }
                }
            }
        }

        let now = crate::now_ms();
        match &failure {
            None => {
                let payload = final_payload(&plan, &order, &mut outputs);
                execution.complete(payload, now).map_err(transition_failed)?;
                tracing::info!(
                    "Execution '{}' completed in {}ms ({} records fetched)",
                    execution.id,
                    clock.elapsed().as_millis(),
                    records_fetched
                );
            }
            Some(err) => {
                execution.fail(err, now).map_err(transition_failed)?;
                tracing::info!(
                    "Execution '{}' ended {:?}: {}",
                    execution.id,
                    execution.status,
                    err
                );
            }
        }

        Ok(ExecutionOutcome {
            execution,
            failure,
            records_fetched,
        })
    }

    async fn run_node(
        &self,
        idx: usize,
        node: &QueryNode,
        input: Value,
        min_confidence: Option<f64>,
        cancel: &CancellationToken,
    ) -> NodeRun {
        let started_at_ms = crate::now_ms();
        let clock = Instant::now();
        let result = self.evaluate(node, input, min_confidence, cancel).await;
        NodeRun {
            idx,
            started_at_ms,
            latency_ms: clock.elapsed().as_millis() as u64,
            result,
        }
    }

    async fn evaluate(
        &self,
        node: &QueryNode,
        input: Value,
        min_confidence: Option<f64>,
        cancel: &CancellationToken,
    ) -> QueryResult<NodeOutput> {
        let failed = |message: String| QueryError::NodeExecutionFailed {
            node_id: node.id.clone(),
            message,
        };

        match &node.config {
            NodeConfig::Source(config) => {
                let fetch = self.coordinator.fetch(config, cancel).await?;
                let warnings = fetch
                    .failed
                    .iter()
                    .map(|f| format!("source '{}' failed and was skipped: {}", f.source, f.error))
                    .collect();
                let value = serde_json::to_value(&fetch.records).map_err(|e| failed(e.to_string()))?;
                Ok(NodeOutput {
                    snapshot: Some(fetch.summary()),
                    records_fetched: fetch.records.len(),
                    value,
                    warnings,
                })
            }
            NodeConfig::Transform(config) => {
                match operators::apply_transform(config, &input).map_err(failed)? {
                    Some(value) => Ok(NodeOutput::plain(value)),
                    None => {
                        let mut output = NodeOutput::plain(input);
                        output.warnings.push(format!(
                            "unknown operator '{}' passed through unchanged",
                            config.operator
                        ));
                        Ok(output)
                    }
                }
            }
            NodeConfig::Aggregate(config) => {
                match operators::apply_aggregate(config, &input).map_err(failed)? {
                    Some(value) => Ok(NodeOutput::plain(value)),
                    None => {
                        let mut output = NodeOutput::plain(input);
                        output.warnings.push(format!(
                            "unknown aggregate function '{}' passed through unchanged",
                            config.function
                        ));
                        Ok(output)
                    }
                }
            }
            NodeConfig::Score(config) => {
                let value =
                    operators::apply_score(config, &input, &self.thresholds).map_err(failed)?;
                let mut output = NodeOutput::plain(value);
                if let Some(min) = min_confidence {
                    let confidence = output
                        .value
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    if confidence < min {
                        output.warnings.push(format!(
                            "low_confidence: score confidence {:.2} is below minConfidence {:.2}",
                            confidence, min
                        ));
                    }
                }
                Ok(output)
            }
            NodeConfig::Output(config) => Ok(NodeOutput::plain(operators::render_output(config, input))),
        }
    }
}

/// Cancel in-flight work and build the TIMEOUT error for a latency breach.
fn breach(
    cancel: &CancellationToken,
    clock: Instant,
    limit_ms: Option<u64>,
    execution_id: &str,
) -> QueryError {
    cancel.cancel();
    tracing::warn!(
        "Execution '{}' breached its latency ceiling, draining in-flight nodes",
        execution_id
    );
    QueryError::Timeout {
        elapsed_ms: clock.elapsed().as_millis() as u64,
        limit_ms: limit_ms.unwrap_or_default(),
    }
}

fn transition_failed(err: TransitionError) -> QueryError {
    QueryError::NodeExecutionFailed {
        node_id: "executor".into(),
        message: err.to_string(),
    }
}

/// One dependency passes its value through; several are concatenated when
/// they are all arrays and collected into an array otherwise.
fn gather_input(deps: &[usize], outputs: &HashMap<usize, Value>) -> Value {
    let values: Vec<&Value> = deps.iter().filter_map(|idx| outputs.get(idx)).collect();
    match values.as_slice() {
        [] => Value::Null,
        [one] => (*one).clone(),
        many if many.iter().all(|v| v.is_array()) => Value::Array(
            many.iter()
                .filter_map(|v| v.as_array())
                .flatten()
                .cloned()
                .collect(),
        ),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    }
}

fn snapshot(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > SNAPSHOT_LIMIT => json!({
            "length": items.len(),
            "head": &items[..SNAPSHOT_LIMIT],
        }),
        other => other.clone(),
    }
}

/// The OUTPUT node's value, an object keyed by node id when a plan has
/// several, or the last node's value when it has none.
fn final_payload(plan: &QueryPlan, order: &[usize], outputs: &mut HashMap<usize, Value>) -> Value {
    let output_nodes: Vec<usize> = plan
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| matches!(node.config, NodeConfig::Output(_)))
        .map(|(idx, _)| idx)
        .collect();

    match output_nodes.as_slice() {
        [] => order
            .last()
            .and_then(|idx| outputs.remove(idx))
            .unwrap_or(Value::Null),
        [only] => outputs.remove(only).unwrap_or(Value::Null),
        many => {
            let mut keyed = Map::new();
            for idx in many {
                keyed.insert(
                    plan.nodes[*idx].id.clone(),
                    outputs.remove(idx).unwrap_or(Value::Null),
                );
            }
            Value::Object(keyed)
        }
    }
}
