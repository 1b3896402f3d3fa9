//! node-network command line.
//!
//! ```text
//! node-network --config network.toml check   validate, print the network
//! node-network --config network.toml probe   reach every key through the retry executor
//! node-network --config network.toml watch   hot reload + periodic probes until Ctrl-C
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use node_network::config::{load_config, ConfigWatcher};
use node_network::observability::{init_logging, metrics};
use node_network::transport::tcp::TcpTransport;
use node_network::{Client, Selection};

#[derive(Parser)]
#[command(name = "node-network")]
#[command(about = "Inspect and probe a network of nodes", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "network.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config and print the resulting network
    Check,
    /// Probe every key once
    Probe,
    /// Reload the config on change and probe periodically
    Watch {
        #[arg(short, long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[derive(Serialize)]
struct ProbeResult {
    key: String,
    ok: bool,
    latency_ms: Option<u64>,
    attempts: Option<u32>,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    init_logging(&config.observability);
    tracing::info!(path = ?cli.config, nodes = config.nodes.len(), "Configuration loaded");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let transport = Arc::new(TcpTransport::new(config.connect_timeout()));
    let client = Arc::new(Client::builder(transport).config(config).build().await?);

    match cli.command {
        Commands::Check => {
            let mut network: Vec<(String, String)> = client.network().await.into_iter().collect();
            network.sort();
            for (address, key) in network {
                println!("{key}\t{address}");
            }
        }
        Commands::Probe => {
            let results = probe(&client).await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Watch { interval_secs } => {
            let (watcher, updates) = ConfigWatcher::new(&cli.config);
            let _watcher = watcher.run()?;
            let updater = client.spawn_config_updates(updates);

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Ctrl-C received, shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = probe(&client).await;
                        let healthy = results.iter().filter(|r| r.ok).count();
                        tracing::info!(keys = results.len(), healthy, "Probe round finished");
                        println!("{}", serde_json::to_string_pretty(&client.snapshot().await)?);
                    }
                }
            }

            updater.abort();
        }
    }

    if let Err(e) = client.close().await {
        tracing::warn!(error = %e, "Close did not finish cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn probe(client: &Client<TcpTransport>) -> Vec<ProbeResult> {
    let mut keys: Vec<String> = client.network().await.into_values().collect();
    keys.sort();
    keys.dedup();

    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
        let outcome = client
            .execute(Selection::Keys(vec![key.clone()]), |ctx| async move {
                ctx.connection.ping().await
            })
            .await;
        results.push(match outcome {
            Ok(latency) => ProbeResult {
                key,
                ok: true,
                latency_ms: Some(latency.as_millis() as u64),
                attempts: None,
                error: None,
            },
            Err(e) => ProbeResult {
                key,
                ok: false,
                latency_ms: None,
                attempts: Some(e.attempts),
                error: Some(e.kind.to_string()),
            },
        });
    }
    results
}
