//! Agent registry: manifest loading, live health status and the probe loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::worker::WorkerClient;

/// Live health state of a registered worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Offline,
    Unknown,
}

impl AgentStatus {
    pub fn is_healthy(self) -> bool {
        matches!(self, AgentStatus::Healthy)
    }
}

/// A worker agent as declared in the manifest, plus its live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub url: String,
    #[serde(default = "unknown_status")]
    pub status: AgentStatus,
}

fn unknown_status() -> AgentStatus {
    AgentStatus::Unknown
}

/// Holds the declarative set of worker agents and their live health status.
///
/// The agent set is fixed after `load`; only per-agent `status` changes at
/// runtime, and each change is atomic for that agent.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<String, Agent>,
    order: Vec<String>,
}

impl AgentRegistry {
    /// Load the registry from a JSON manifest. A missing or malformed
    /// manifest is fatal; there are no partial loads.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("agent manifest not readable at {}", path.display()))?;
        let agents: Vec<Agent> = serde_json::from_str(&raw)
            .with_context(|| format!("agent manifest at {} is malformed", path.display()))?;
        let registry = Self::from_agents(agents)?;
        info!("Loaded {} agents from {}", registry.len(), path.display());
        Ok(registry)
    }

    /// Build a registry from already-parsed manifest entries.
    pub fn from_agents(list: Vec<Agent>) -> Result<Self> {
        let agents = DashMap::new();
        let mut order = Vec::with_capacity(list.len());
        for agent in list {
            if agent.id.trim().is_empty() {
                bail!("agent manifest entry has an empty id");
            }
            let id = agent.id.clone();
            if agents.insert(id.clone(), agent).is_some() {
                bail!("duplicate agent id '{}' in manifest", id);
            }
            order.push(id);
        }
        Ok(Self { agents, order })
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    /// All agents in manifest order, with their current status.
    pub fn list(&self) -> Vec<Agent> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.get(id).map(|entry| entry.status)
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.status = status;
        }
    }

    /// Demote an agent after a transport-level failure; the next probe round
    /// may promote it again.
    pub fn mark_offline(&self, id: &str) {
        self.set_status(id, AgentStatus::Offline);
    }

    /// First healthy agent in candidate rank order.
    pub fn first_healthy(&self, candidates: &[String]) -> Option<Agent> {
        candidates.iter().find_map(|id| {
            let entry = self.agents.get(id)?;
            entry.status.is_healthy().then(|| entry.value().clone())
        })
    }

    /// Probe every agent's health endpoint concurrently and record the
    /// outcome. One agent's probe never blocks or fails another's.
    #[instrument(skip(self, client))]
    pub async fn health_check(&self, client: &dyn WorkerClient) {
        let probes = self.list().into_iter().map(|agent| async move {
            let status = client.probe_health(&agent).await;
            (agent.id, status)
        });

        for (id, status) in futures::future::join_all(probes).await {
            self.set_status(&id, status);
        }
        info!("Agent health checks complete");
    }
}

/// Periodic health-check task with its own lifecycle: started at boot,
/// stopped cooperatively at shutdown.
pub struct HealthMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the probe loop. The first round runs immediately, then once per
    /// `interval`, independent of request traffic.
    pub fn start(
        registry: Arc<AgentRegistry>,
        client: Arc<dyn WorkerClient>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.health_check(client.as_ref()).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Health monitor stopping");
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Health monitor task failed to stop cleanly: {}", e);
        }
    }
}
