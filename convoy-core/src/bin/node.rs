//! In-process Convoy cluster
//!
//! Runs several nodes over the in-memory liveness store and command hub with
//! a demo `ticker` agent family, and serves metrics on `/metrics`.

use async_trait::async_trait;
use axum::{routing::get, Router};
use convoy_core::agent::{Agent, AgentFamily, AgentStatus, AgentUri, FamilyRegistry};
use convoy_core::coordinator::{ClusterConfig, ControlAddress};
use convoy_core::runtime::ShutdownSignal;
use convoy_core::storage::InMemoryLivenessStore;
use convoy_core::transport::InMemoryCommandHub;
use convoy_core::{ClusterNode, ConvoyError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Agent that counts ticks until stopped
struct TickerAgent {
    uri: AgentUri,
    period: Duration,
    ticks: Arc<AtomicU64>,
    stop: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Agent for TickerAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    async fn start(&self) -> Result<()> {
        let uri = self.uri.clone();
        let period = self.period;
        let ticks = self.ticks.clone();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = interval.tick() => {
                        let count = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("{} tick {}", uri, count);
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|e| ConvoyError::AgentFailed {
                uri: self.uri.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        match self.task.lock().as_ref() {
            None if self.stop.is_shutdown() => AgentStatus::Stopped,
            None => AgentStatus::Idle,
            Some(task) if task.is_finished() => AgentStatus::Faulted,
            Some(_) => AgentStatus::Running,
        }
    }
}

struct TickerFamily {
    agents: usize,
    period: Duration,
}

#[async_trait]
impl AgentFamily for TickerFamily {
    fn scheme(&self) -> &str {
        "ticker"
    }

    async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>> {
        (0..self.agents)
            .map(|i| AgentUri::new("ticker", &format!("{:03}", i)))
            .collect()
    }

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>> {
        if !self.all_known_agents().await?.contains(uri) {
            return Err(ConvoyError::UnknownAgent { uri: uri.clone() });
        }
        Ok(Arc::new(TickerAgent {
            uri: uri.clone(),
            period: self.period,
            ticks: Arc::new(AtomicU64::new(0)),
            stop: ShutdownSignal::new(),
            task: Mutex::new(None),
        }))
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Convoy cluster");

    // Load configuration from environment
    let base = ClusterConfig::from_env()?;
    let node_count = env_usize("CONVOY_NODE_COUNT", 3);
    let agent_count = env_usize("CONVOY_AGENT_COUNT", 12);
    let metrics_addr: SocketAddr = std::env::var("CONVOY_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".into())
        .parse()?;

    let family = Arc::new(TickerFamily {
        agents: agent_count,
        period: Duration::from_secs(1),
    });
    let registry = FamilyRegistry::new().with(family)?;
    let store = Arc::new(InMemoryLivenessStore::new());
    let hub = InMemoryCommandHub::new();

    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let config = ClusterConfig {
            control_address: ControlAddress::new(format!("{}/{}", base.control_address, i)),
            ..base.clone()
        };
        let (channel, inbox) = hub.connect(config.control_address.clone());
        let node = ClusterNode::start(config, registry.clone(), store.clone(), channel, inbox).await?;
        nodes.push(node);
    }
    info!("{} nodes running {} ticker agents", node_count, agent_count);

    // Start Metrics API Server
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(|| async { convoy_core::metrics::gather_system_metrics() }))
            .layer(CorsLayer::permissive());

        info!("Metrics API listening on {}", metrics_addr);
        let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to bind metrics listener: {}", e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            error!("Node {} did not shut down cleanly: {}", node.id(), e);
        }
    }
    Ok(())
}
