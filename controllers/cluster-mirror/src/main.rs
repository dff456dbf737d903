//! Cluster Mirror
//!
//! Maintains a live watch cache over the managed cluster identified by the
//! current kubeconfig and forwards workload change events to a logging
//! handler. Mostly useful as a harness around the watch-cache crate; real
//! deployments register their own reconciliation handlers.

mod handler;

use std::env;
use std::sync::Arc;

use handler::LoggingHandler;
use kube::Client;
use tracing::info;
use watch_cache::{CacheBuilder, ClusterHandle, ClusterRef, ResourceCatalog, ResourceHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting Cluster Mirror");

    // Load configuration from environment variables
    let cluster_name = env::var("CLUSTER_NAME").unwrap_or_else(|_| "default".to_string());
    let catalog = match env::var("CATALOG_FILE") {
        Ok(path) => ResourceCatalog::from_yaml(&std::fs::read_to_string(&path)?)?,
        Err(_) => ResourceCatalog::default_set(),
    };

    info!("Configuration:");
    info!("  Cluster: {}", cluster_name);
    info!("  Cataloged kinds: {}", catalog.len());

    let client = Client::try_default().await?;
    let cluster: Arc<dyn ClusterHandle> = Arc::new(ClusterRef::new(&cluster_name, &cluster_name));

    let coordinator = CacheBuilder::new(catalog)
        .handler("Pod", Arc::new(LoggingHandler) as Arc<dyn ResourceHandler>)
        .handler("Deployment", Arc::new(LoggingHandler) as Arc<dyn ResourceHandler>)
        .build(cluster, client)
        .await?;
    coordinator.enable_bidirectional_sync();

    let pods = coordinator.lister("pods")?;
    info!("Cluster Mirror ready, {} pods cached", pods.list_all().len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    coordinator.stop().await;

    Ok(())
}
