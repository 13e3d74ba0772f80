#![warn(missing_docs)]
//! Directory replication daemon

use dirsrv_repl::config::ReplConfig;
use dirsrv_repl::engine::ReplicationEngine;
use dirsrv_repl::loopback::LoopbackNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ReplConfig::from_file(&PathBuf::from(path))?,
        None => ReplConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("dirsrv replication daemon starting...");
    let validated = config.validate()?;

    let network = Arc::new(LoopbackNetwork::new());
    let engine = Arc::new(ReplicationEngine::new(validated.engine, network.clone()));
    network.register(&config.host, config.port, &engine);

    for settings in validated.replicas {
        let replica = engine.add_memory_replica(settings)?;
        tracing::info!(replica = %replica.name(), root = %replica.root(), "replica configured");
    }
    let added = engine.populate_agreements(&validated.agreements);
    tracing::info!(agreements = added, "agreements configured");
    engine.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    engine.shutdown().await;
    Ok(())
}
