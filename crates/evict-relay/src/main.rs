//! evict-relay - broadcast relay for cache eviction notifications
//!
//! Listens on the given port (default 9999) and forwards every eviction it
//! receives to all other connected nodes. Each CTRL-C prints the connected
//! peers; the relay stops after the configured number of them.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use evict_relay::{RelayConfig, RelayServer, RelayState, DEFAULT_PORT};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evict-relay")]
#[command(about = "Broadcast relay for cache eviction notifications")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::with_port(cli.port);
    let signals = config.signal_count;

    let server = RelayServer::bind(config)
        .await
        .context("failed to start relay")?;
    info!(
        addr = %server.local_addr()?,
        "relay started, press CTRL-C {signals} times to stop"
    );

    let watcher = tokio::spawn(watch_signals(
        server.state(),
        server.shutdown_token(),
        signals,
    ));
    server.serve().await?;
    watcher.abort();
    Ok(())
}

/// Print the peer report on every CTRL-C and stop the relay after `count`.
async fn watch_signals(state: Arc<RelayState>, shutdown: CancellationToken, count: u32) {
    for received in 1..=count {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for CTRL-C");
            return;
        }
        print_report(&state);
        let remaining = count - received;
        if remaining > 0 {
            println!("press CTRL-C {remaining} more time(s) to stop");
        }
    }
    shutdown.cancel();
}

fn print_report(state: &RelayState) {
    let report = state.report();
    println!(
        "{} peer(s) connected, {} eviction(s) relayed",
        report.len(),
        state.broadcasts()
    );
    for peer in report {
        println!("  {peer}");
    }
}
