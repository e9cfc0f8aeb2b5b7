//! seclab: emulated heterogeneous network topologies for security
//! experimentation. Local nodes are network namespaces, remote nodes are
//! pods, and links between them are negotiated tunnels.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

mod config;
mod engine;
mod error;
mod exec;
mod lifecycle;
mod link;
mod orchestrator;
mod portforward;
mod routing;
mod topology;

use config::{Config, NodeKindDecl};
use engine::{Engine, NetnsEngine};
use lifecycle::Lab;
use orchestrator::{KubeOrchestrator, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::load()?;
    info!(
        "Starting seclab with {} nodes and {} links",
        config.topology.nodes.len(),
        config.topology.links.len()
    );

    let engine: Arc<dyn Engine> = Arc::new(NetnsEngine::new());
    let wants_remote = config
        .topology
        .nodes
        .iter()
        .any(|n| n.kind == NodeKindDecl::Remote);
    let orch: Option<Arc<dyn Orchestrator>> = if wants_remote {
        Some(Arc::new(
            KubeOrchestrator::new(config.namespace.clone()).await?,
        ))
    } else {
        None
    };

    let mut lab = Lab::new(config, engine, orch)?;
    if let Err(e) = lab.start().await {
        error!("Bring-up failed: {e}");
        lab.stop().await;
        return Err(e.into());
    }
    for (what, err) in lab.failures() {
        warn!("Degraded: {what}: {err}");
    }
    info!("Topology is up. Press Ctrl+C to tear down.");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    lab.stop().await;
    info!("Shutdown complete.");
    Ok(())
}
