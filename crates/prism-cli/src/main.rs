//! # prism — operator CLI
//!
//! - `prism plan` compiles a query locally and prints the node table and hash.
//! - `prism query` submits the same request to a running hub.
//! - `prism sources`, `prism executions`, `prism execution <id>` inspect the hub.
//!
//! The hub address comes from `PRISM_BASE_URL` (default `http://127.0.0.1:3400`).

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tabled::{Table, Tabled};

use prism_core::{PlanCompiler, QueryPlan, QueryRequest};

const HOUR_MS: i64 = 3_600_000;

#[derive(Parser)]
#[command(name = "prism", version, about = "PRISM federated analytics CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query offline and print its DAG.
    Plan {
        #[command(flatten)]
        query: QueryArgs,

        /// Print the full plan as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Submit a query to the hub.
    Query {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// List registered data sources.
    Sources,

    /// List recent executions.
    Executions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one execution with its node trace.
    Execution { id: String },
}

#[derive(Args, Clone)]
struct QueryArgs {
    /// Seller the query is scoped to.
    #[arg(long)]
    seller: String,

    /// ANOMALY, PREDICTION, INSIGHT, FUNNEL or CUSTOM.
    #[arg(long, default_value = "ANOMALY")]
    kind: String,

    /// Window start (epoch ms). Defaults to `--hours` before `--end`.
    #[arg(long)]
    start: Option<i64>,

    /// Window end (epoch ms). Defaults to now.
    #[arg(long)]
    end: Option<i64>,

    /// Window length when `--start` is omitted.
    #[arg(long, default_value_t = 24)]
    hours: i64,

    /// Comma-separated transform operators, e.g. FIR,EWMA.
    #[arg(long, value_delimiter = ',')]
    operators: Vec<String>,

    /// Comma-separated aggregate functions, e.g. AVG,DAILY.
    #[arg(long, value_delimiter = ',')]
    aggregations: Vec<String>,

    /// Comma-separated output formats: json, csv, summary.
    #[arg(long, value_delimiter = ',')]
    output: Vec<String>,

    /// Comma-separated source types, e.g. hot,cold.
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,

    /// Union-merge every listed source.
    #[arg(long, conflicts_with = "partial")]
    merge: bool,

    /// Accept partial results once this many sources succeed.
    #[arg(long)]
    partial: Option<usize>,

    #[arg(long)]
    max_latency_ms: Option<u64>,

    #[arg(long)]
    min_confidence: Option<f64>,

    /// Forbid sampling so the plan hash is replayable.
    #[arg(long)]
    reproducible: bool,
}

impl QueryArgs {
    fn to_request(&self, now_ms: i64) -> Result<QueryRequest, String> {
        let end = self.end.unwrap_or(now_ms);
        let start = self
            .start
            .unwrap_or_else(|| end.saturating_sub(self.hours.max(0) * HOUR_MS));

        let mut body = Map::new();
        body.insert("sellerId".into(), json!(self.seller));
        body.insert("queryType".into(), json!(self.kind));
        body.insert("window".into(), json!({ "start": start, "end": end }));
        body.insert("operators".into(), json!(self.operators));
        body.insert("aggregations".into(), json!(self.aggregations));
        body.insert("output".into(), json!(self.output));
        body.insert("sources".into(), json!(self.sources));
        body.insert("reproducible".into(), json!(self.reproducible));

        if let Some(min_sources) = self.partial {
            body.insert(
                "federation".into(),
                json!({ "partial": { "min_sources": min_sources } }),
            );
        } else if self.merge {
            body.insert(
                "federation".into(),
                json!({ "merge": { "strategy": "union" } }),
            );
        }

        let mut constraints = Map::new();
        if let Some(ms) = self.max_latency_ms {
            constraints.insert("maxLatencyMs".into(), json!(ms));
        }
        if let Some(c) = self.min_confidence {
            constraints.insert("minConfidence".into(), json!(c));
        }
        if !constraints.is_empty() {
            body.insert("constraints".into(), Value::Object(constraints));
        }

        serde_json::from_value(Value::Object(body)).map_err(|e| format!("invalid query: {}", e))
    }
}

#[derive(Tabled)]
struct NodeRow {
    id: String,
    #[tabled(rename = "type")]
    node_type: String,
    label: String,
    #[tabled(rename = "depends on")]
    dependencies: String,
}

fn node_rows(plan: &QueryPlan) -> Vec<NodeRow> {
    plan.nodes
        .iter()
        .map(|node| NodeRow {
            id: node.id.clone(),
            node_type: node.node_type().to_string(),
            label: node.config.label(),
            dependencies: node
                .dependencies
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect()
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { query, json } => {
            let request = match query.to_request(chrono::Utc::now().timestamp_millis()) {
                Ok(request) => request,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(2);
                }
            };
            let plan = match PlanCompiler::default().compile(&request) {
                Ok(plan) => plan,
                Err(e) => {
                    eprintln!("Error [{}]: {}", e.kind(), e);
                    std::process::exit(1);
                }
            };

            if json {
                print_json(&serde_json::to_value(&plan).unwrap_or(Value::Null));
                return;
            }
            println!("{}", Table::new(node_rows(&plan)));
            println!("plan:    {}", plan.id);
            println!("mode:    {:?}", plan.mode);
            println!("cost:    {:.2}", plan.estimated_cost);
            println!("catalog: {}", plan.config_version);
            println!("hash:    {}", plan.reproducibility_hash);
        }

        cmd => {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to build tokio runtime: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = rt.block_on(async_main(cmd)) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn async_main(cmd: Commands) -> Result<(), String> {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("PRISM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:3400".to_string());

    match cmd {
        Commands::Query { query } => {
            let request = query.to_request(chrono::Utc::now().timestamp_millis())?;
            let url = format!("{}/api/query", base_url);
            let body = send(client.post(&url).json(&request)).await?;
            print_json(&body);
        }

        Commands::Sources => {
            let url = format!("{}/api/sources", base_url);
            print_json(&send(client.get(&url)).await?);
        }

        Commands::Executions { limit } => {
            let url = format!("{}/api/executions?limit={}", base_url, limit);
            print_json(&send(client.get(&url)).await?);
        }

        Commands::Execution { id } => {
            let url = format!("{}/api/executions/{}", base_url, id);
            print_json(&send(client.get(&url)).await?);
        }

        Commands::Plan { .. } => {}
    }
    Ok(())
}

/// Send a request and decode its JSON body; non-2xx responses become the
/// server's `kind: message`.
async fn send(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let resp = request.send().await.map_err(|e| e.to_string())?;
    let status = resp.status();
    let body: Value = resp.json().await.map_err(|e| e.to_string())?;
    if status.is_success() {
        return Ok(body);
    }
    let kind = body.get("kind").and_then(Value::as_str).unwrap_or("Error");
    let message = body.get("message").and_then(Value::as_str).unwrap_or("");
    match body.get("execution_id").and_then(Value::as_str) {
        Some(id) => Err(format!("{} {}: {} (execution {})", status, kind, message, id)),
        None => Err(format!("{} {}: {}", status, kind, message)),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> QueryArgs {
        let mut argv = vec!["prism", "plan", "--seller", "s1"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Plan { query, .. } => query,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_window_defaults_to_trailing_hours() {
        let req = args(&["--hours", "2"]).to_request(10 * HOUR_MS).unwrap();
        let window = req.window.unwrap();
        assert_eq!(window.end, 10 * HOUR_MS);
        assert_eq!(window.start, 8 * HOUR_MS);
    }

    #[test]
    fn test_comma_lists_become_request_fields() {
        let req = args(&["--operators", "FIR,EWMA", "--sources", "hot,cold", "--partial", "1"])
            .to_request(HOUR_MS)
            .unwrap();
        assert_eq!(req.operators, vec!["FIR", "EWMA"]);
        assert_eq!(req.sources.len(), 2);
        assert!(req.federation.is_some());
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let err = args(&["--sources", "tape"]).to_request(HOUR_MS).unwrap_err();
        assert!(err.contains("invalid query"));
    }

    #[test]
    fn test_plan_table_lists_every_node() {
        let req = args(&["--operators", "FIR"]).to_request(HOUR_MS).unwrap();
        let plan = PlanCompiler::default().compile(&req).unwrap();
        let rows = node_rows(&plan);
        assert_eq!(rows.len(), plan.nodes.len());
        assert_eq!(rows[0].node_type, "SOURCE");
        assert!(rows[0].dependencies.is_empty());
        assert!(!rows[1].dependencies.is_empty());
    }
}
