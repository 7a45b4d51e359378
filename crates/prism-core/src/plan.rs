//! # Query Plans
//!
//! A compiled, immutable DAG of typed processing nodes. The plan owns every
//! node; dependencies are id references into the same plan.
//!
//! Node ids are content-addressed (`n<position>-<digest>`), and the
//! reproducibility hash is computed over a structural view that replaces ids
//! with dependency positions. Two compilations of the same request therefore
//! agree on both ids and hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::{QueryError, QueryResult};
use crate::hash::{canonical_digest, NODE_DOMAIN, PLAN_DOMAIN};
use crate::model::{OutputFormat, SamplingPolicy, TimeWindow};
use crate::source::{Capability, SourceType};

pub type NodeId = String;

/// Operator/algorithm parameters. Ordered so serialization is stable.
pub type Params = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One node at a time in topological order.
    Sequential,
    /// Every ready node is dispatched at once.
    Parallel,
    /// Parallel when more than one node is ready, inline otherwise.
    #[default]
    Adaptive,
}

/// How a federated SOURCE node merges adapter results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Concatenate every successful adapter's records.
    Union,
    /// Keyed inner join across every successful adapter.
    Join { key: String },
}

/// Fetch policy of a SOURCE node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FederationMode {
    /// Exactly one adapter.
    #[default]
    Single,
    /// All configured adapters, merged; fails only if none succeed.
    Merge(MergeStrategy),
    /// All configured adapters, unioned; fails below `min_sources` successes.
    Partial { min_sources: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreType {
    Anomaly,
    Prediction,
    Health,
    Quality,
}

impl fmt::Display for ScoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anomaly => write!(f, "ANOMALY"),
            Self::Prediction => write!(f, "PREDICTION"),
            Self::Health => write!(f, "HEALTH"),
            Self::Quality => write!(f, "QUALITY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub seller_id: String,
    pub window: TimeWindow,
    pub sources: Vec<SourceType>,
    #[serde(default)]
    pub federation: FederationMode,
    #[serde(default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub sampling: SamplingPolicy,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    pub operator: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub function: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub score_type: ScoreType,
    pub algorithm: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub max_results: usize,
}

/// Variant-specific node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeConfig {
    Source(SourceConfig),
    Transform(TransformConfig),
    Aggregate(AggregateConfig),
    Score(ScoreConfig),
    Output(OutputConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Source,
    Transform,
    Aggregate,
    Score,
    Output,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "SOURCE"),
            Self::Transform => write!(f, "TRANSFORM"),
            Self::Aggregate => write!(f, "AGGREGATE"),
            Self::Score => write!(f, "SCORE"),
            Self::Output => write!(f, "OUTPUT"),
        }
    }
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Source(_) => NodeType::Source,
            Self::Transform(_) => NodeType::Transform,
            Self::Aggregate(_) => NodeType::Aggregate,
            Self::Score(_) => NodeType::Score,
            Self::Output(_) => NodeType::Output,
        }
    }

    /// Short human label: operator, function, algorithm or format.
    pub fn label(&self) -> String {
        match self {
            Self::Source(c) => c
                .sources
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("+"),
            Self::Transform(c) => c.operator.clone(),
            Self::Aggregate(c) => c.function.clone(),
            Self::Score(c) => format!("{}:{}", c.score_type, c.algorithm),
            Self::Output(c) => c.format.to_string(),
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryNode {
    pub id: NodeId,
    pub config: NodeConfig,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
}

impl QueryNode {
    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

/// Deterministic id derived from a node's position and configuration.
pub fn content_node_id(position: usize, config: &NodeConfig) -> QueryResult<NodeId> {
    #[derive(Serialize)]
    struct Addressed<'a> {
        position: usize,
        config: &'a NodeConfig,
    }
    let digest = canonical_digest(NODE_DOMAIN, &Addressed { position, config })?;
    Ok(format!("n{}-{}", position, &digest[..12]))
}

/// An immutable compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub id: String,
    pub nodes: Vec<QueryNode>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub reproducibility_hash: String,
    #[serde(default)]
    pub config_version: String,
}

/// Plan identity returned alongside fresh results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: String,
    pub node_count: usize,
    pub reproducibility_hash: String,
}

impl QueryPlan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            id: self.id.clone(),
            node_count: self.nodes.len(),
            reproducibility_hash: self.reproducibility_hash.clone(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&QueryNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Compute the reproducibility hash and derive the plan id from it.
    ///
    /// Used by the compiler and for hand-authored plans that arrive without
    /// a hash.
    pub fn seal(mut self) -> QueryResult<Self> {
        let hash = self.structural_hash()?;
        self.id = format!("plan-{}", &hash[..16]);
        self.reproducibility_hash = hash;
        Ok(self)
    }

    /// Digest over node types, configs, dependency positions, execution
    /// mode, constraints and estimated cost. Node ids never enter the digest.
    pub fn structural_hash(&self) -> QueryResult<String> {
        #[derive(Serialize)]
        struct StructuralNode<'a> {
            config: &'a NodeConfig,
            dependencies: Vec<usize>,
        }
        #[derive(Serialize)]
        struct StructuralPlan<'a> {
            nodes: Vec<StructuralNode<'a>>,
            mode: ExecutionMode,
            max_latency_ms: Option<u64>,
            min_confidence: Option<f64>,
            max_cost: Option<f64>,
            estimated_cost: f64,
        }

        let positions = self.positions()?;
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut dependencies = Vec::with_capacity(node.dependencies.len());
            for dep in &node.dependencies {
                let pos = positions.get(dep.as_str()).ok_or_else(|| {
                    QueryError::InvalidRequest(format!(
                        "node {} depends on unknown node {}",
                        node.id, dep
                    ))
                })?;
                dependencies.push(*pos);
            }
            nodes.push(StructuralNode {
                config: &node.config,
                dependencies,
            });
        }

        canonical_digest(
            PLAN_DOMAIN,
            &StructuralPlan {
                nodes,
                mode: self.mode,
                max_latency_ms: self.max_latency_ms,
                min_confidence: self.min_confidence,
                max_cost: self.max_cost,
                estimated_cost: self.estimated_cost,
            },
        )
    }

    /// Check id uniqueness, dependency existence and acyclicity.
    pub fn validate(&self) -> QueryResult<()> {
        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm over node positions. Ties resolve in plan order so
    /// the result is deterministic.
    ///
    /// Fails with [`QueryError::InvalidRequest`] for duplicate ids or
    /// dangling dependencies and [`QueryError::CyclicPlan`] when no order
    /// exists.
    pub fn topological_order(&self) -> QueryResult<Vec<usize>> {
        let positions = self.positions()?;
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &node.dependencies {
                let dep_idx = *positions.get(dep.as_str()).ok_or_else(|| {
                    QueryError::InvalidRequest(format!(
                        "node {} depends on unknown node {}",
                        node.id, dep
                    ))
                })?;
                if seen.insert(dep_idx) {
                    in_degree[idx] += 1;
                    dependents[dep_idx].push(idx);
                }
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter_map(|(idx, &d)| (d == 0).then_some(idx))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(QueryError::CyclicPlan {
                unresolved: self.nodes.len() - order.len(),
            });
        }
        Ok(order)
    }

    fn positions(&self) -> QueryResult<HashMap<&str, usize>> {
        let mut positions = HashMap::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if positions.insert(node.id.as_str(), idx).is_some() {
                return Err(QueryError::InvalidRequest(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(id: &str, deps: &[&str]) -> QueryNode {
        QueryNode {
            id: id.into(),
            config: NodeConfig::Transform(TransformConfig {
                operator: "DIFF".into(),
                params: Params::new(),
            }),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn plan(nodes: Vec<QueryNode>) -> QueryPlan {
        QueryPlan {
            id: String::new(),
            nodes,
            mode: ExecutionMode::Adaptive,
            max_latency_ms: None,
            min_confidence: None,
            max_cost: None,
            estimated_cost: 0.0,
            reproducibility_hash: String::new(),
            config_version: "test".into(),
        }
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        // Authored in reverse order on purpose.
        let p = plan(vec![
            transform("c", &["b"]),
            transform("b", &["a"]),
            transform("a", &[]),
        ]);
        assert_eq!(p.topological_order().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let p = plan(vec![transform("a", &["b"]), transform("b", &["a"])]);
        assert_eq!(
            p.topological_order(),
            Err(QueryError::CyclicPlan { unresolved: 2 })
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let p = plan(vec![transform("a", &["a"])]);
        assert!(matches!(p.validate(), Err(QueryError::CyclicPlan { .. })));
    }

    #[test]
    fn test_dangling_dependency_is_invalid() {
        let p = plan(vec![transform("a", &["ghost"])]);
        assert!(matches!(p.validate(), Err(QueryError::InvalidRequest(_))));
    }

    #[test]
    fn test_duplicate_ids_are_invalid() {
        let p = plan(vec![transform("a", &[]), transform("a", &[])]);
        assert!(matches!(p.validate(), Err(QueryError::InvalidRequest(_))));
    }

    #[test]
    fn test_structural_hash_ignores_node_ids() {
        let a = plan(vec![transform("x1", &[]), transform("x2", &["x1"])]);
        let b = plan(vec![transform("y1", &[]), transform("y2", &["y1"])]);
        assert_eq!(a.structural_hash().unwrap(), b.structural_hash().unwrap());

        let rewired = plan(vec![transform("y1", &["y2"]), transform("y2", &[])]);
        assert_ne!(
            a.structural_hash().unwrap(),
            rewired.structural_hash().unwrap()
        );
    }

    #[test]
    fn test_seal_derives_id_from_hash() {
        let sealed = plan(vec![transform("a", &[])]).seal().unwrap();
        assert_eq!(sealed.reproducibility_hash.len(), 64);
        assert_eq!(
            sealed.id,
            format!("plan-{}", &sealed.reproducibility_hash[..16])
        );
    }

    #[test]
    fn test_node_config_serializes_with_type_tag() {
        let node = transform("a", &[]);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["config"]["type"], "TRANSFORM");
        let back: QueryNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
