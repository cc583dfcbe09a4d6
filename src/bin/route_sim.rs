use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tableroute::{
    CallContext, Client, ClientConfig, InMemoryCluster, Point, SqlQueryRequest, WriteRequest,
};

#[derive(Parser)]
#[command(name = "route-sim")]
#[command(about = "Runs writes and queries through the routing client against a simulated cluster")]
struct Cli {
    /// JSON topology: endpoints, table owners and offline endpoints
    #[arg(long)]
    topology: PathBuf,
    #[arg(long, default_value = "public")]
    database: String,
    /// Per remote call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long, default_value_t = 1)]
    write_concurrency: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Write {
        /// JSON array of points
        #[arg(long)]
        points: PathBuf,
    },
    Query {
        #[arg(long = "table", required = true)]
        tables: Vec<String>,
        #[arg(long)]
        sql: String,
    },
}

#[derive(Debug, Deserialize)]
struct Topology {
    endpoints: Vec<String>,
    #[serde(default)]
    tables: BTreeMap<String, String>,
    #[serde(default)]
    offline: Vec<String>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

async fn build_cluster(topology: &Topology) -> Result<InMemoryCluster> {
    if topology.endpoints.is_empty() {
        bail!("topology must list at least one endpoint");
    }
    let cluster = InMemoryCluster::new();
    for endpoint in &topology.endpoints {
        cluster.register_endpoint(endpoint.as_str()).await?;
    }
    for (table, endpoint) in &topology.tables {
        cluster
            .assign_table(table.as_str(), endpoint)
            .await
            .with_context(|| format!("failed to assign table '{}'", table))?;
    }
    for endpoint in &topology.offline {
        cluster.set_online(endpoint, false).await?;
    }
    Ok(cluster)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let topology: Topology = read_json(&cli.topology)?;
    let cluster = build_cluster(&topology).await?;

    let mut config = ClientConfig::new(&topology.endpoints[0])
        .database(&cli.database)
        .write_concurrency(cli.write_concurrency);
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.rpc_timeout(Duration::from_millis(timeout_ms));
    }
    let client = Client::new(config, Arc::new(cluster.clone()), Arc::new(cluster.clone()))?;
    let ctx = CallContext::background();
    let cancel = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Write { points } => {
            let points: Vec<Point> = read_json(&points)?;
            for point in &points {
                point.validate()?;
            }
            let resp = client.write(&ctx, WriteRequest::new(points)).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Command::Query { tables, sql } => {
            let resp = client
                .query(&ctx, SqlQueryRequest::new(tables, sql))
                .await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    let stats = cluster.stats().await;
    eprintln!(
        "route fetches: {}, query calls: {}, write calls: {}",
        stats.route_fetches, stats.query_calls, stats.write_calls
    );
    Ok(())
}
