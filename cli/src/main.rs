//! beaconrpc CLI: query several beacon nodes as one from the terminal.
//!
//! Usage:
//! ```bash
//! # Finality checkpoints, accepted once two nodes agree
//! beaconrpc --policy majority:2 finality \
//!     --url http://node-a:5052 --url http://node-b:5052 --url http://node-c:5052
//!
//! # Attester duties for two validators
//! beaconrpc duties --url http://node-a:5052 --epoch 1234 --index 10 --index 11
//!
//! # Probe every node and print the health table
//! beaconrpc health --url http://node-a:5052 --url http://node-b:5052
//! ```
//!
//! Output is JSON on stdout; logs go to stderr and follow `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use beaconrpc_core::types::{
    AttesterDutiesOpts, Epoch, FinalityOpts, ValidatorIndex, VoluntaryExitPoolOpts,
};
use beaconrpc_core::{AggregationPolicy, BeaconProvider, MultiClient, MultiClientConfig};
use beaconrpc_http::{HttpBeaconProvider, HttpProviderConfig};

#[derive(Parser, Debug)]
#[command(name = "beaconrpc", version, about = "Query several beacon nodes as one", long_about = None)]
struct Cli {
    /// Aggregation policy: `first`, `majority:N` or `all`.
    #[arg(long, global = true)]
    policy: Option<AggregationPolicy>,

    /// TOML file with client and HTTP settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bound on the whole call, in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Nodes {
    /// Beacon node base URL; repeat for each node.
    #[arg(long = "url", required = true)]
    urls: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Finality checkpoints of a state.
    Finality {
        #[command(flatten)]
        nodes: Nodes,
        /// State identifier: head, finalized, a slot or a state root.
        #[arg(long, default_value = "head")]
        state: String,
    },
    /// Attester duties for an epoch.
    Duties {
        #[command(flatten)]
        nodes: Nodes,
        #[arg(long)]
        epoch: u64,
        /// Validator index; repeat for each validator.
        #[arg(long = "index", required = true)]
        indices: Vec<u64>,
    },
    /// Voluntary exits waiting in the pool.
    Exits {
        #[command(flatten)]
        nodes: Nodes,
    },
    /// Probe each node's health endpoint.
    Health {
        #[command(flatten)]
        nodes: Nodes,
    },
}

/// Contents of `--config`: the client settings at the top level plus an
/// `[http]` table for the per-node HTTP settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    client: MultiClientConfig,
    http: HttpProviderConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(policy) = cli.policy {
            self.client.dispatch.default_policy = policy;
        }
        if let Some(ms) = cli.timeout_ms {
            let timeout = Duration::from_millis(ms);
            self.client.dispatch.call_timeout = timeout;
            self.client.dispatch.attempt_timeout = self.client.dispatch.attempt_timeout.min(timeout);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    config.apply(&cli);

    let output = match &cli.command {
        Command::Finality { nodes, state } => {
            let client = build_client(nodes, &config)?;
            let opts = FinalityOpts { state: state.clone() };
            serde_json::to_value(client.finality(&opts).await?)?
        }
        Command::Duties { nodes, epoch, indices } => {
            let client = build_client(nodes, &config)?;
            let opts = AttesterDutiesOpts {
                epoch: Epoch(*epoch),
                indices: indices.iter().copied().map(ValidatorIndex).collect(),
            };
            serde_json::to_value(client.attester_duties(&opts).await?)?
        }
        Command::Exits { nodes } => {
            let client = build_client(nodes, &config)?;
            serde_json::to_value(client.voluntary_exit_pool(&VoluntaryExitPoolOpts::default()).await?)?
        }
        Command::Health { nodes } => {
            let client = build_client(nodes, &config)?;
            cmd_health(&client).await?
        }
    };

    if output["metadata"]["disagreement"] == Value::Bool(true) {
        tracing::warn!("nodes disagree; see candidates");
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn build_client(nodes: &Nodes, config: &FileConfig) -> Result<MultiClient> {
    let providers = nodes
        .urls
        .iter()
        .map(|url| {
            HttpBeaconProvider::new(url.as_str(), config.http.clone())
                .map(|p| Arc::new(p) as Arc<dyn BeaconProvider>)
                .with_context(|| format!("creating provider for {url}"))
        })
        .collect::<Result<Vec<_>>>()?;
    MultiClient::new(providers, config.client.clone()).context("building client")
}

/// Probe every node once, concurrently, and return the health table.
async fn cmd_health(client: &MultiClient) -> Result<Value> {
    for report in client.probe_all().await {
        let latency_ms = report.latency.as_millis() as u64;
        match &report.error {
            None => tracing::info!(provider = %report.provider, latency_ms, "node ready"),
            Some(error) => tracing::warn!(provider = %report.provider, latency_ms, %error, "node not ready"),
        }
    }
    Ok(serde_json::to_value(client.health_summary())?)
}
