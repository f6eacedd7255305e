//! Edge worker binary.
//!
//! Polls the queues authorized by the control plane and runs their jobs.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_worker::action::{ActionMap, CommandDispatcher, ProcessRunner};
use edge_worker::client::ControlPlaneClient;
use edge_worker::queue::SqsClientFactory;
use edge_worker::repository::{GitCli, RepositoryRegistry};
use edge_worker::{EdgeConfig, Processor};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_worker=debug".into());

    let json = std::env::var("EDGE_WORKER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting edge worker");

    let config = EdgeConfig::from_env()?;
    tracing::info!(
        control_plane = %config.control_plane.url,
        min_workers = config.pool.min_workers,
        max_workers = config.pool.max_workers,
        "Configuration loaded"
    );

    let actions = Arc::new(ActionMap::load(&config.processor.action_map_path).await?);
    let control_plane = Arc::new(ControlPlaneClient::new(&config.control_plane)?);
    let repositories = Arc::new(RepositoryRegistry::new(
        config.processor.checkout_dir.clone(),
        Arc::new(GitCli::new()),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        actions.clone(),
        repositories.clone(),
        Arc::new(ProcessRunner::new()),
        control_plane.clone(),
    ));

    let processor = Processor::new(
        config.clone(),
        control_plane,
        Arc::new(SqsClientFactory::new(config.queue.clone())),
        dispatcher,
        actions,
        repositories,
    );

    processor.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    processor.stop().await?;
    tracing::info!("Edge worker stopped");
    Ok(())
}
