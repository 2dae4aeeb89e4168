//! Worker protocol models and the HTTP client used to probe and invoke
//! worker agents.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::registry::{Agent, AgentStatus};

/// Sender identity stamped on every outgoing task envelope.
pub const ENVELOPE_SENDER: &str = "switchboard";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub name: String,
    pub parameters: Value,
}

/// Task assignment sent to a worker's `/process` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub task: WorkerTask,
    pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(recipient: &str, task: WorkerTask) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender: ENVELOPE_SENDER.to_string(),
            recipient: recipient.to_string(),
            kind: "task_assignment".to_string(),
            task,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// Completion report returned by a worker. A `FAILURE` status is a normal
/// reply at this layer; the dispatcher decides how to surface it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub message_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub related_message_id: String,
    pub status: ReportStatus,
    #[serde(default)]
    pub results: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

/// The dispatch engine's view of a worker: a health endpoint and a task
/// endpoint. Behind a trait so the control plane can be tested offline.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Probe a worker's health endpoint. Infallible by design: anything
    /// short of a well-formed reply maps to `Offline`.
    async fn probe_health(&self, agent: &Agent) -> AgentStatus;

    /// Forward a task envelope and return the worker's completion report.
    async fn forward(&self, agent: &Agent, envelope: TaskEnvelope) -> Result<CompletionReport>;
}

/// Production worker client over HTTP.
pub struct HttpWorkerClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    forward_timeout: Duration,
}

impl HttpWorkerClient {
    pub fn new(probe_timeout: Duration, forward_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            probe_timeout,
            forward_timeout,
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    async fn probe_health(&self, agent: &Agent) -> AgentStatus {
        let url = format!("{}/health", agent.url);

        let response = match self.http.get(&url).timeout(self.probe_timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Health probe failed: {}", e);
                return AgentStatus::Offline;
            }
        };

        if !response.status().is_success() {
            warn!("Health probe returned status {}", response.status());
            return AgentStatus::Offline;
        }

        match response.json::<HealthBody>().await {
            Ok(body) => match body.status.as_str() {
                "healthy" => AgentStatus::Healthy,
                "degraded" => AgentStatus::Degraded,
                other => {
                    warn!("Health probe returned unexpected status '{}'", other);
                    AgentStatus::Offline
                }
            },
            Err(e) => {
                warn!("Health probe body was malformed: {}", e);
                AgentStatus::Offline
            }
        }
    }

    #[instrument(skip(self, agent, envelope), fields(agent_id = %agent.id, message_id = %envelope.message_id))]
    async fn forward(&self, agent: &Agent, envelope: TaskEnvelope) -> Result<CompletionReport> {
        let url = format!("{}/process", agent.url);

        let response = self
            .http
            .post(&url)
            .timeout(self.forward_timeout)
            .json(&envelope)
            .send()
            .await
            .with_context(|| format!("failed to reach worker '{}'", agent.id))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("worker '{}' replied with status {}", agent.id, status));
        }

        response
            .json::<CompletionReport>()
            .await
            .with_context(|| format!("worker '{}' returned a malformed completion report", agent.id))
    }
}
