use std::time::Duration;

use clap::Parser;
use edge_telemetry::{
    agent::{
        publisher::PublisherHandle,
        sampler::{Sampler, spawn_sampler},
    },
    config::read_agent_config,
};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

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
        ("agent", LevelFilter::TRACE),
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

    let config = read_agent_config(&args.file)?;
    info!(
        "agent {} publishing to {}:{} every {}s",
        config.device_id, config.broker.host, config.broker.port, config.interval_secs
    );

    let (sample_tx, sample_rx) = unbounded_channel();

    let sampler = Sampler::new(config.device_id.clone());
    let interval = Duration::from_secs(config.interval_secs);
    let sampler_task = spawn_sampler(sampler, interval, sample_tx);

    let (publisher, publisher_task) = PublisherHandle::spawn(config, sample_rx);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    sampler_task.abort();
    publisher.shutdown().await?;
    // wait for the actor to close the broker connection before exiting
    publisher_task.await?;

    Ok(())
}
