use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prism_core::catalog::DEFAULT_CATALOG_VERSION;
use prism_core::compiler::DEFAULT_MAX_RESULTS;
use prism_core::{CompilerOptions, Params, PlanCompiler, PlannerCatalog, SourceType, StaticCatalog};

mod api;
mod cache;
mod executor;
mod federation;
mod service;
mod sources;
mod store;

use cache::{CachePolicy, CacheStats, ResultCache};
use executor::DagExecutor;
use federation::{FederatedFetchCoordinator, DEFAULT_FETCH_TIMEOUT};
use service::QueryService;
use sources::aggregate::AggregateStoreAdapter;
use sources::cold::{ColdStoreAdapter, MemoryEventStore};
use sources::hot::{HotBufferAdapter, DEFAULT_HOT_WINDOW};
use sources::metrics_cache::MetricsCacheAdapter;
use sources::registry::SourceRegistry;
use sources::webhook::{WebhookAdapter, WebhookStats};
use store::ExecutionStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const COLD_STORE_LATENCY: Duration = Duration::from_millis(25);

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "prism-hub",
    version,
    about = "PRISM federated analytics query engine"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3400")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "prism-hub.toml")]
    config: PathBuf,

    /// Append-only execution trace journal
    #[arg(long)]
    trace_journal: Option<PathBuf>,

    /// Populate the in-memory backends with synthetic demo records
    #[arg(long)]
    seed_demo: bool,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    cache: CachePolicy,
    #[serde(default)]
    planner: PlannerConfig,
    #[serde(default)]
    sources: SourcesConfig,
}

#[derive(Deserialize, Clone)]
struct ServerConfig {
    #[serde(default = "default_execution_history")]
    execution_history: usize,
    #[serde(default = "default_cache_sweep_interval")]
    cache_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            execution_history: default_execution_history(),
            cache_sweep_interval_secs: default_cache_sweep_interval(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct PlannerConfig {
    #[serde(default)]
    strict_operators: bool,
    #[serde(default = "default_max_results")]
    max_results: usize,
    #[serde(default = "default_config_version")]
    config_version: String,
    #[serde(default = "default_sources")]
    default_sources: Vec<SourceType>,
    /// `[planner.operators.<NAME>]` parameter overrides.
    #[serde(default)]
    operators: BTreeMap<String, Params>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            strict_operators: false,
            max_results: default_max_results(),
            config_version: default_config_version(),
            default_sources: default_sources(),
            operators: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct SourcesConfig {
    #[serde(default = "default_hot_capacity")]
    hot_capacity: usize,
    #[serde(default = "default_hot_window")]
    hot_window: usize,
    #[serde(default = "default_webhook_capacity")]
    webhook_capacity: usize,
    #[serde(default = "default_fetch_timeout")]
    fetch_timeout_ms: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            hot_capacity: default_hot_capacity(),
            hot_window: default_hot_window(),
            webhook_capacity: default_webhook_capacity(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

fn default_execution_history() -> usize {
    1000
}
fn default_cache_sweep_interval() -> u64 {
    30
}
fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}
fn default_config_version() -> String {
    DEFAULT_CATALOG_VERSION.to_string()
}
fn default_sources() -> Vec<SourceType> {
    vec![SourceType::Hot]
}
fn default_hot_capacity() -> usize {
    65_536
}
fn default_hot_window() -> usize {
    DEFAULT_HOT_WINDOW
}
fn default_webhook_capacity() -> usize {
    4096
}
fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_millis() as u64
}

fn load_config(path: &PathBuf) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Could not read config {:?}: {}, using defaults", path, e);
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Invalid config {:?}: {}, using defaults", path, e);
            Config::default()
        }
    }
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    service: QueryService,
    registry: Arc<SourceRegistry>,
    hot: Arc<HotBufferAdapter>,
    webhook: Arc<WebhookAdapter>,
    cache: Arc<ResultCache>,
    store: Arc<ExecutionStore>,
    start_time: Instant,
    catalog_version: String,
}

#[derive(Serialize)]
struct SystemStatus {
    version: &'static str,
    uptime_seconds: u64,
    catalog_version: String,
    sources_registered: usize,
    hot_buffered: usize,
    executions_stored: usize,
    trace_journal: Option<String>,
    cache: CacheStats,
    webhook: WebhookStats,
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: VERSION,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        catalog_version: state.catalog_version.clone(),
        sources_registered: state.registry.len().await,
        hot_buffered: state.hot.len().await,
        executions_stored: state.store.len().await,
        trace_journal: state
            .store
            .journal_path()
            .map(|p| p.display().to_string()),
        cache: state.cache.stats().await,
        webhook: state.webhook.stats().await,
    })
}

// =============================================================================
// Background Cache Sweep
// =============================================================================

async fn cache_sweeper(cache: Arc<ResultCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let purged = cache.purge_expired().await;
        if purged > 0 {
            tracing::debug!("Cache sweep purged {} expired entries", purged);
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "prism_hub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    // Sources
    let registry = Arc::new(SourceRegistry::new());
    let hot = Arc::new(HotBufferAdapter::new(
        config.sources.hot_capacity,
        config.sources.hot_window,
    ));
    let webhook = Arc::new(WebhookAdapter::new(config.sources.webhook_capacity));
    registry.register(hot.clone()).await;
    registry
        .register(Arc::new(AggregateStoreAdapter::new()))
        .await;
    registry.register(Arc::new(MetricsCacheAdapter::new())).await;
    registry
        .register(Arc::new(ColdStoreAdapter::new(Arc::new(
            MemoryEventStore::new(COLD_STORE_LATENCY),
        ))))
        .await;
    registry.register(webhook.clone()).await;

    if args.seed_demo {
        sources::seed::seed_registry(&registry, sources::seed::DEMO_SELLER, now_ms()).await;
    }

    // Planner
    let catalog = StaticCatalog::default()
        .with_operator_overrides(config.planner.operators.clone())
        .with_version(config.planner.config_version.clone());
    let thresholds = catalog.sufficiency();
    let catalog_version = catalog.version().to_string();
    let compiler = PlanCompiler::new(
        catalog,
        CompilerOptions {
            strict_operators: config.planner.strict_operators,
            max_results: config.planner.max_results,
            default_sources: config.planner.default_sources.clone(),
        },
    );

    // Execution
    let coordinator = Arc::new(FederatedFetchCoordinator::new(
        registry.clone(),
        Duration::from_millis(config.sources.fetch_timeout_ms),
    ));
    let executor = DagExecutor::new(coordinator, thresholds);
    let cache = Arc::new(ResultCache::new(config.cache.clone()));

    let store = match &args.trace_journal {
        None => ExecutionStore::new(config.server.execution_history),
        Some(path) => {
            if path.exists() {
                match ExecutionStore::replay_journal(path) {
                    Ok(report) => tracing::info!(
                        "Replayed {} trace records from {:?} ({} corrupt lines)",
                        report.entries.len(),
                        path,
                        report.corrupt_lines.len()
                    ),
                    Err(e) => tracing::warn!("Could not replay trace journal {:?}: {}", path, e),
                }
            }
            match ExecutionStore::new(config.server.execution_history).with_journal(path) {
                Ok(store) => store,
                Err(e) => {
                    tracing::error!("Failed to open trace journal at {:?}: {}", path, e);
                    std::process::exit(1);
                }
            }
        }
    };
    let store = Arc::new(store);

    let state = Arc::new(AppState {
        service: QueryService::new(compiler, executor, cache.clone(), store.clone()),
        registry,
        hot,
        webhook,
        cache: cache.clone(),
        store,
        start_time: Instant::now(),
        catalog_version,
    });

    let sweep_every = Duration::from_secs(config.server.cache_sweep_interval_secs.max(1));
    tokio::spawn(async move { cache_sweeper(cache, sweep_every).await });

    let app = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/query", post(api::submit_query))
        .route("/api/plans/compile", post(api::compile_plan))
        .route("/api/plans/execute", post(api::execute_plan))
        .route("/api/executions", get(api::list_executions))
        .route("/api/executions/:id", get(api::get_execution))
        .route("/api/sources", get(api::list_sources))
        .route("/api/sources/health", post(api::refresh_source_health))
        .route("/api/sources/webhook/ingest", post(api::ingest_webhook))
        .route("/api/cache", get(api::cache_stats))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match args.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid bind address '{}': {}", args.bind, e);
            std::process::exit(1);
        }
    };
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  PRISM v{}", VERSION);
    tracing::info!("  API:      http://{}/api/status", addr);
    tracing::info!("  Catalog:  {}", config.planner.config_version);
    tracing::info!("  Journal:  {:?}", args.trace_journal);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
