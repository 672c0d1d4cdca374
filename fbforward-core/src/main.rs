//! Userspace TCP/UDP port forwarder with a live upstream quality-scoring
//! engine. Wires configuration, the upstream manager, the reachability
//! prober, the measurement scheduler and the TCP/UDP forwarders together
//! under one supervisor (§2, §9).

mod config;
mod control;
mod error;
mod metrics_sink;
mod model;
mod prober;
mod scheduler;
mod scoring;
mod status_sink;
mod supervisor;
mod tcp_forwarder;
mod udp_forwarder;
mod upstream_manager;

use std::sync::Arc;
use supervisor::Runtime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> error::Result<()> {
    let cfg = config::Config::load_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cfg.logging.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if cfg.listeners.is_empty() {
        tracing::warn!("no listeners configured, nothing to forward");
    }

    let runtime = Arc::new(Runtime::new(cfg));

    let shutdown_tx = runtime.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    runtime.run().await
}
