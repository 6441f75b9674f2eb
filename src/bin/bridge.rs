use std::time::Duration;

use clap::Parser;
use edge_telemetry::{
    bridge::{BridgeHandle, ingest::spawn_ingest, notifier::spawn_notifier, ws::spawn_ws_server},
    config::read_bridge_config,
};
use tokio::sync::mpsc;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Alerts buffered towards the notifier before they get dropped.
const ALERT_BUFFER: usize = 64;

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("edge_telemetry", LevelFilter::TRACE),
        ("bridge", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_bridge_config(&args.file)?;

    let (alert_tx, alert_rx) = mpsc::channel(ALERT_BUFFER);
    let notifier = spawn_notifier(config.webhook_url.clone(), alert_rx);

    let bridge = BridgeHandle::spawn(
        config.thresholds,
        Duration::from_secs(config.prune_window_secs),
        alert_tx,
    );

    let ingest = spawn_ingest(config.broker.clone(), bridge.clone());
    let addr = spawn_ws_server(config.bind_addr, bridge.clone()).await?;
    info!("dashboard feed available at ws://{addr}/ws");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    ingest.abort();
    bridge.shutdown().await?;
    notifier.await?;

    Ok(())
}
