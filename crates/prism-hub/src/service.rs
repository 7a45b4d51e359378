//! # Query Service
//!
//! The compile+execute entrypoint. A request is fingerprinted first; a live
//! cache entry answers immediately without touching the executor or the
//! execution store. Otherwise the request is compiled, executed, stored and
//! cached.

use std::sync::Arc;

use prism_core::{
    PlanCompiler, PlanSummary, QueryError, QueryExecution, QueryPlan, QueryRequest, QueryResult,
};
use serde::Serialize;
use serde_json::Value;

use crate::cache::ResultCache;
use crate::executor::{DagExecutor, ExecutionFailure};
use crate::store::ExecutionStore;

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub cached: bool,
    pub fingerprint: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub struct QueryService {
    compiler: PlanCompiler,
    executor: DagExecutor,
    cache: Arc<ResultCache>,
    store: Arc<ExecutionStore>,
}

impl QueryService {
    pub fn new(
        compiler: PlanCompiler,
        executor: DagExecutor,
        cache: Arc<ResultCache>,
        store: Arc<ExecutionStore>,
    ) -> Self {
        Self {
            compiler,
            executor,
            cache,
            store,
        }
    }

    pub fn compile(&self, request: &QueryRequest) -> QueryResult<QueryPlan> {
        self.compiler.compile(request)
    }

    pub async fn submit(&self, request: &QueryRequest) -> Result<QueryResponse, ExecutionFailure> {
        let fingerprint = self.compiler.fingerprint(request)?;
        if let Some(entry) = self.cache.get(&fingerprint).await {
            return Ok(QueryResponse {
                cached: true,
                fingerprint,
                payload: entry.payload.clone(),
                plan: None,
                execution_id: None,
                warnings: Vec::new(),
            });
        }

        let plan = self.compiler.compile(request)?;
        let (execution, records_fetched) = self.run(plan).await?;
        let payload = execution.result.clone().unwrap_or(Value::Null);
        self.cache
            .put(
                fingerprint.clone(),
                payload.clone(),
                execution.plan.clone(),
                self.cache.ttl_for_volume(records_fetched),
            )
            .await;

        Ok(QueryResponse {
            cached: false,
            fingerprint,
            payload,
            plan: Some(execution.plan.summary()),
            execution_id: Some(execution.id.clone()),
            warnings: execution.warnings.clone(),
        })
    }

    /// Execute a client-supplied plan. A plan without a hash is sealed here;
    /// one carrying a hash must match its own content.
    pub async fn execute_plan(&self, plan: QueryPlan) -> Result<Arc<QueryExecution>, ExecutionFailure> {
        let plan = if plan.reproducibility_hash.is_empty() {
            plan.seal()?
        } else {
            let actual = plan.structural_hash()?;
            if actual != plan.reproducibility_hash {
                return Err(QueryError::InvalidRequest(format!(
                    "reproducibility hash {} does not match plan content ({})",
                    plan.reproducibility_hash, actual
                ))
                .into());
            }
            plan
        };
        let (execution, _) = self.run(plan).await?;
        Ok(execution)
    }

    async fn run(&self, plan: QueryPlan) -> Result<(Arc<QueryExecution>, usize), ExecutionFailure> {
        let outcome = self.executor.execute(plan).await?;
        let records_fetched = outcome.records_fetched;
        let stored = self.store.insert(outcome.execution).await;
        match outcome.failure {
            None => Ok((stored, records_fetched)),
            Some(error) => Err(ExecutionFailure {
                error,
                execution_id: Some(stored.id.clone()),
            }),
        }
    }
}
