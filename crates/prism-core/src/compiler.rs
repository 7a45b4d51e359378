//! # Query Plan Compiler
//!
//! Turns a [`QueryRequest`] into a linear DAG:
//!
//! ```text
//! SOURCE → TRANSFORM* → AGGREGATE* → SCORE → OUTPUT
//! ```
//!
//! Compilation is total for valid requests and deterministic: node ids are
//! content-addressed and the reproducibility hash excludes them, so
//! compiling the same request twice yields identical plans.

use serde::Serialize;

use crate::catalog::{PlannerCatalog, StaticCatalog};
use crate::error::{QueryError, QueryResult};
use crate::hash::{canonical_digest, FINGERPRINT_DOMAIN};
use crate::model::{
    OutputFormat, QueryConstraints, QueryKind, QueryRequest, SamplingPolicy, TimeWindow,
};
use crate::plan::{
    content_node_id, AggregateConfig, ExecutionMode, FederationMode, MergeStrategy, NodeConfig,
    OutputConfig, Params, QueryNode, QueryPlan, ScoreConfig, ScoreType, SourceConfig,
    TransformConfig,
};
use crate::source::{Capability, SourceType};

pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Map a query kind to the score it produces. Anything without an explicit
/// mapping falls back to ANOMALY.
pub fn score_type_for(kind: &QueryKind) -> ScoreType {
    match kind {
        QueryKind::Anomaly => ScoreType::Anomaly,
        QueryKind::Prediction => ScoreType::Prediction,
        QueryKind::Insight => ScoreType::Health,
        QueryKind::Funnel => ScoreType::Quality,
        QueryKind::Custom | QueryKind::Other(_) => ScoreType::Anomaly,
    }
}

/// Deterministic cost estimate used for `maxCost` admission.
pub fn estimate_cost(nodes: &[QueryNode]) -> f64 {
    nodes
        .iter()
        .map(|node| match &node.config {
            NodeConfig::Source(c) => 10.0 * c.sources.len().max(1) as f64,
            NodeConfig::Transform(_) => 2.0,
            NodeConfig::Aggregate(_) => 1.0,
            NodeConfig::Score(_) => 5.0,
            NodeConfig::Output(_) => 1.0,
        })
        .sum()
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Reject operator/aggregate names missing from the catalog.
    pub strict_operators: bool,
    /// Result-size cap written into the OUTPUT node.
    pub max_results: usize,
    /// Sources used when the request names none.
    pub default_sources: Vec<SourceType>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            strict_operators: false,
            max_results: DEFAULT_MAX_RESULTS,
            default_sources: vec![SourceType::Hot],
        }
    }
}

/// A request with every default applied. This is what gets compiled and
/// what the cache fingerprint covers.
#[derive(Debug, Clone, Serialize)]
struct ResolvedRequest {
    seller_id: String,
    kind: String,
    window: TimeWindow,
    operators: Vec<String>,
    aggregations: Vec<String>,
    output: OutputFormat,
    constraints: QueryConstraints,
    sampling: SamplingPolicy,
    sources: Vec<SourceType>,
    federation: FederationMode,
    record_type: Option<String>,
    required_capabilities: Vec<Capability>,
    mode: ExecutionMode,
    reproducible: bool,
    catalog_version: String,
    #[serde(skip)]
    score_type: ScoreType,
}

pub struct PlanCompiler<C: PlannerCatalog = StaticCatalog> {
    catalog: C,
    options: CompilerOptions,
}

impl Default for PlanCompiler<StaticCatalog> {
    fn default() -> Self {
        Self::new(StaticCatalog::default(), CompilerOptions::default())
    }
}

impl<C: PlannerCatalog> PlanCompiler<C> {
    pub fn new(catalog: C, options: CompilerOptions) -> Self {
        Self { catalog, options }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile a request into a sealed plan.
    pub fn compile(&self, request: &QueryRequest) -> QueryResult<QueryPlan> {
        let resolved = self.resolve(request)?;
        let mut nodes: Vec<QueryNode> = Vec::with_capacity(4 + resolved.operators.len());

        let source = NodeConfig::Source(SourceConfig {
            seller_id: resolved.seller_id.clone(),
            window: resolved.window,
            sources: resolved.sources.clone(),
            federation: resolved.federation.clone(),
            record_type: resolved.record_type.clone(),
            sampling: resolved.sampling.clone(),
            required_capabilities: resolved.required_capabilities.clone(),
        });
        push_chained(&mut nodes, source)?;

        for operator in &resolved.operators {
            let params = self.lookup(operator, "operator", |c, name| {
                c.operator_defaults(name)
            })?;
            push_chained(
                &mut nodes,
                NodeConfig::Transform(TransformConfig {
                    operator: operator.clone(),
                    params,
                }),
            )?;
        }

        for function in &resolved.aggregations {
            let params = self.lookup(function, "aggregate function", |c, name| {
                c.aggregate_defaults(name)
            })?;
            push_chained(
                &mut nodes,
                NodeConfig::Aggregate(AggregateConfig {
                    function: function.clone(),
                    params,
                }),
            )?;
        }

        let (algorithm, params) = self.catalog.score_defaults(resolved.score_type);
        push_chained(
            &mut nodes,
            NodeConfig::Score(ScoreConfig {
                score_type: resolved.score_type,
                algorithm,
                params,
            }),
        )?;

        push_chained(
            &mut nodes,
            NodeConfig::Output(OutputConfig {
                format: resolved.output,
                max_results: self.options.max_results,
            }),
        )?;

        let estimated_cost = estimate_cost(&nodes);
        if let Some(max_cost) = resolved.constraints.max_cost {
            if estimated_cost > max_cost {
                return Err(QueryError::InvalidRequest(format!(
                    "estimated cost {} exceeds maxCost {}",
                    estimated_cost, max_cost
                )));
            }
        }

        QueryPlan {
            id: String::new(),
            nodes,
            mode: resolved.mode,
            max_latency_ms: resolved.constraints.max_latency_ms,
            min_confidence: resolved.constraints.min_confidence,
            max_cost: resolved.constraints.max_cost,
            estimated_cost,
            reproducibility_hash: String::new(),
            config_version: self.catalog.version().to_string(),
        }
        .seal()
    }

    /// Cache key for a request: digest of the request with all defaults
    /// applied, so equivalent spellings share an entry.
    pub fn fingerprint(&self, request: &QueryRequest) -> QueryResult<String> {
        let resolved = self.resolve(request)?;
        canonical_digest(FINGERPRINT_DOMAIN, &resolved)
    }

    fn lookup(
        &self,
        name: &str,
        what: &str,
        get: impl Fn(&C, &str) -> Option<Params>,
    ) -> QueryResult<Params> {
        match get(&self.catalog, name) {
            Some(params) => Ok(params),
            None if self.options.strict_operators => Err(QueryError::InvalidRequest(format!(
                "unknown {} '{}'",
                what, name
            ))),
            None => Ok(Params::new()),
        }
    }

    fn resolve(&self, request: &QueryRequest) -> QueryResult<ResolvedRequest> {
        let (seller_id, kind, window) = request.validate()?;

        let operators = normalize_names(&request.operators, "operator")?;
        let aggregations = normalize_names(&request.aggregations, "aggregation")?;

        let mut sources: Vec<SourceType> = Vec::new();
        let requested = if request.sources.is_empty() {
            &self.options.default_sources
        } else {
            &request.sources
        };
        for source in requested {
            if !sources.contains(source) {
                sources.push(*source);
            }
        }
        if sources.is_empty() {
            return Err(QueryError::InvalidRequest(
                "at least one data source is required".into(),
            ));
        }

        let federation = match request.federation.clone() {
            None if sources.len() == 1 => FederationMode::Single,
            None => FederationMode::Merge(MergeStrategy::Union),
            Some(FederationMode::Single) if sources.len() > 1 => {
                return Err(QueryError::InvalidRequest(format!(
                    "single-source fetch cannot name {} sources",
                    sources.len()
                )));
            }
            Some(FederationMode::Partial { min_sources }) if min_sources > sources.len() => {
                return Err(QueryError::InvalidRequest(format!(
                    "min_sources {} exceeds the {} configured sources",
                    min_sources,
                    sources.len()
                )));
            }
            Some(mode) => mode,
        };

        let mut required_capabilities = request.required_capabilities.clone();
        required_capabilities.sort();
        required_capabilities.dedup();

        Ok(ResolvedRequest {
            seller_id: seller_id.to_string(),
            kind: kind.to_string(),
            window,
            operators,
            aggregations,
            output: request.output_formats.first().copied().unwrap_or_default(),
            constraints: request.constraints.clone().unwrap_or_default(),
            sampling: request.sampling.clone().unwrap_or_default(),
            sources,
            federation,
            record_type: request
                .record_type
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            required_capabilities,
            mode: request.mode.unwrap_or_default(),
            reproducible: request.reproducible,
            catalog_version: self.catalog.version().to_string(),
            score_type: score_type_for(kind),
        })
    }
}

fn normalize_names(names: &[String], what: &str) -> QueryResult<Vec<String>> {
    names
        .iter()
        .map(|raw| {
            let name = raw.trim().to_ascii_uppercase();
            if name.is_empty() {
                Err(QueryError::InvalidRequest(format!("empty {} name", what)))
            } else {
                Ok(name)
            }
        })
        .collect()
}

/// Append a node that depends on the previously appended node.
fn push_chained(nodes: &mut Vec<QueryNode>, config: NodeConfig) -> QueryResult<()> {
    let position = nodes.len();
    let id = content_node_id(position, &config)?;
    let dependencies = nodes.last().map(|n| vec![n.id.clone()]).unwrap_or_default();
    nodes.push(QueryNode {
        id,
        config,
        dependencies,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NodeType;
    use crate::model::{SamplingMode, TimeWindow};

    const T: i64 = 1_700_000_000_000;

    fn anomaly_request() -> QueryRequest {
        QueryRequest::new("s1", QueryKind::Anomaly, TimeWindow::new(T, T + 3_600_000))
            .with_operators(["FIR", "FFT"])
            .with_output(OutputFormat::Json)
    }

    #[test]
    fn test_compiles_five_node_chain() {
        let plan = PlanCompiler::default().compile(&anomaly_request()).unwrap();
        let types: Vec<NodeType> = plan.nodes.iter().map(|n| n.node_type()).collect();
        assert_eq!(
            types,
            vec![
                NodeType::Source,
                NodeType::Transform,
                NodeType::Transform,
                NodeType::Score,
                NodeType::Output
            ]
        );
        for pair in plan.nodes.windows(2) {
            assert_eq!(pair[1].dependencies, vec![pair[0].id.clone()]);
        }
        assert!(plan.nodes[0].dependencies.is_empty());
        match &plan.nodes[3].config {
            NodeConfig::Score(c) => {
                assert_eq!(c.score_type, ScoreType::Anomaly);
                assert_eq!(c.algorithm, "zscore_anomaly");
            }
            other => panic!("expected score node, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let compiler = PlanCompiler::default();
        let a = compiler.compile(&anomaly_request()).unwrap();
        let b = compiler.compile(&anomaly_request()).unwrap();
        assert_eq!(a.reproducibility_hash, b.reproducibility_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_survives_node_renaming() {
        let mut plan = PlanCompiler::default().compile(&anomaly_request()).unwrap();
        let original = plan.reproducibility_hash.clone();

        // Re-key every node with fresh ids, rewiring dependencies.
        let renamed: Vec<(String, String)> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), format!("fresh-{}", i * 7)))
            .collect();
        for node in &mut plan.nodes {
            for (old, new) in &renamed {
                if &node.id == old {
                    node.id = new.clone();
                }
                for dep in &mut node.dependencies {
                    if dep == old {
                        *dep = new.clone();
                    }
                }
            }
        }
        assert_eq!(plan.structural_hash().unwrap(), original);
    }

    #[test]
    fn test_plan_is_topologically_valid() {
        let plan = PlanCompiler::default().compile(&anomaly_request()).unwrap();
        let order = plan.topological_order().unwrap();
        let mut seen = std::collections::HashSet::new();
        for idx in order {
            for dep in &plan.nodes[idx].dependencies {
                assert!(seen.contains(dep), "dependency {} not yet executed", dep);
            }
            seen.insert(plan.nodes[idx].id.clone());
        }
    }

    #[test]
    fn test_no_transforms_scores_straight_from_source() {
        let req = QueryRequest::new("s1", QueryKind::Insight, TimeWindow::new(0, 10));
        let plan = PlanCompiler::default().compile(&req).unwrap();
        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(plan.nodes[1].dependencies, vec![plan.nodes[0].id.clone()]);
        match &plan.nodes[1].config {
            NodeConfig::Score(c) => assert_eq!(c.score_type, ScoreType::Health),
            other => panic!("expected score node, got {:?}", other),
        }
    }

    #[test]
    fn test_score_mapping_defaults_to_anomaly() {
        assert_eq!(score_type_for(&QueryKind::Prediction), ScoreType::Prediction);
        assert_eq!(score_type_for(&QueryKind::Funnel), ScoreType::Quality);
        assert_eq!(score_type_for(&QueryKind::Custom), ScoreType::Anomaly);
        assert_eq!(
            score_type_for(&QueryKind::Other("RETENTION".into())),
            ScoreType::Anomaly
        );
    }

    #[test]
    fn test_unknown_operator_gets_empty_params() {
        let req = QueryRequest::new("s1", QueryKind::Anomaly, TimeWindow::new(0, 10))
            .with_operators(["wavelet"]);
        let plan = PlanCompiler::default().compile(&req).unwrap();
        match &plan.nodes[1].config {
            NodeConfig::Transform(c) => {
                assert_eq!(c.operator, "WAVELET");
                assert!(c.params.is_empty());
            }
            other => panic!("expected transform node, got {:?}", other),
        }
    }

    #[test]
    fn test_strict_mode_rejects_unknown_operator() {
        let compiler = PlanCompiler::new(
            StaticCatalog::default(),
            CompilerOptions {
                strict_operators: true,
                ..Default::default()
            },
        );
        let req = QueryRequest::new("s1", QueryKind::Anomaly, TimeWindow::new(0, 10))
            .with_operators(["FIR", "FRI"]);
        assert!(matches!(
            compiler.compile(&req),
            Err(QueryError::InvalidRequest(msg)) if msg.contains("FRI")
        ));
    }

    #[test]
    fn test_output_defaults_to_json_and_carries_cap() {
        let req = QueryRequest::new("s1", QueryKind::Anomaly, TimeWindow::new(0, 10));
        let plan = PlanCompiler::default().compile(&req).unwrap();
        match &plan.nodes.last().unwrap().config {
            NodeConfig::Output(c) => {
                assert_eq!(c.format, OutputFormat::Json);
                assert_eq!(c.max_results, DEFAULT_MAX_RESULTS);
            }
            other => panic!("expected output node, got {:?}", other),
        }
    }

    #[test]
    fn test_source_sampling_disabled_by_default() {
        let plan = PlanCompiler::default().compile(&anomaly_request()).unwrap();
        match &plan.nodes[0].config {
            NodeConfig::Source(c) => {
                assert_eq!(c.seller_id, "s1");
                assert_eq!(c.sampling.mode, SamplingMode::None);
                assert_eq!(c.sources, vec![SourceType::Hot]);
                assert_eq!(c.federation, FederationMode::Single);
            }
            other => panic!("expected source node, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_sources_default_to_union() {
        let mut req = anomaly_request();
        req.sources = vec![SourceType::Hot, SourceType::Cold, SourceType::Hot];
        let plan = PlanCompiler::default().compile(&req).unwrap();
        match &plan.nodes[0].config {
            NodeConfig::Source(c) => {
                assert_eq!(c.sources, vec![SourceType::Hot, SourceType::Cold]);
                assert_eq!(c.federation, FederationMode::Merge(MergeStrategy::Union));
            }
            other => panic!("expected source node, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_floor_above_source_count_is_invalid() {
        let mut req = anomaly_request();
        req.sources = vec![SourceType::Hot, SourceType::Cold];
        req.federation = Some(FederationMode::Partial { min_sources: 3 });
        assert!(matches!(
            PlanCompiler::default().compile(&req),
            Err(QueryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_max_cost_below_estimate_is_rejected() {
        let mut req = anomaly_request();
        req.constraints = Some(QueryConstraints {
            max_cost: Some(5.0),
            ..Default::default()
        });
        assert!(matches!(
            PlanCompiler::default().compile(&req),
            Err(QueryError::InvalidRequest(msg)) if msg.contains("maxCost")
        ));
    }

    #[test]
    fn test_constraints_change_the_hash() {
        let compiler = PlanCompiler::default();
        let base = compiler.compile(&anomaly_request()).unwrap();
        let mut req = anomaly_request();
        req.constraints = Some(QueryConstraints {
            max_latency_ms: Some(500),
            ..Default::default()
        });
        let constrained = compiler.compile(&req).unwrap();
        assert_ne!(base.reproducibility_hash, constrained.reproducibility_hash);
        assert_eq!(constrained.max_latency_ms, Some(500));
    }

    #[test]
    fn test_fingerprint_normalizes_spelling() {
        let compiler = PlanCompiler::default();
        let a = anomaly_request();
        let mut b = anomaly_request();
        b.seller_id = "  s1 ".into();
        b.operators = vec!["fir".into(), " fft".into()];
        b.output_formats.clear();
        b.sources = vec![SourceType::Hot];
        assert_eq!(
            compiler.fingerprint(&a).unwrap(),
            compiler.fingerprint(&b).unwrap()
        );

        let mut c = anomaly_request();
        c.window = Some(TimeWindow::new(T, T + 1));
        assert_ne!(
            compiler.fingerprint(&a).unwrap(),
            compiler.fingerprint(&c).unwrap()
        );
    }

    #[test]
    fn test_invalid_request_never_compiles() {
        let req = QueryRequest::default();
        assert!(matches!(
            PlanCompiler::default().compile(&req),
            Err(QueryError::InvalidRequest(_))
        ));
    }
}
