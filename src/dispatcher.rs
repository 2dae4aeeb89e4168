//! The dispatch state machine: classify a request, ask for clarification or
//! resolve a healthy target with failover, forward, and record the outcome.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::classifier::{IntentClassifier, IntentResult};
use crate::error::DispatchError;
use crate::memory::{
    consecutive_clarifications, CachedExchange, ConversationMemory, ConversationMessage,
    ShortTermCache,
};
use crate::registry::AgentRegistry;
use crate::worker::{ReportStatus, TaskEnvelope, WorkerClient, WorkerTask};

/// An incoming dispatch request from the outer transport layer.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub explicit_agent_id: Option<String>,
    #[serde(default)]
    pub auto_route: bool,
}

/// A non-error dispatch result; failures travel as [`DispatchError`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched {
        agent_id: String,
        response: Value,
        confidence: f64,
        reasoning: String,
    },
    ClarificationNeeded {
        clarifying_questions: Vec<String>,
        clarification_count: usize,
        max_clarifications: usize,
    },
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub fallback_agent_id: String,
    /// Clarification rounds allowed before best-effort routing kicks in.
    pub max_clarification_attempts: usize,
    /// Messages of history consulted per request.
    pub recent_lookback: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fallback_agent_id: "general_assistant".to_string(),
            max_clarification_attempts: 3,
            recent_lookback: 10,
        }
    }
}

/// Orchestrates a single dispatch: memory, classification, health-based
/// target resolution, forwarding and bookkeeping.
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    memory: Arc<ConversationMemory>,
    cache: Arc<ShortTermCache>,
    classifier: IntentClassifier,
    worker: Arc<dyn WorkerClient>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        memory: Arc<ConversationMemory>,
        cache: Arc<ShortTermCache>,
        classifier: IntentClassifier,
        worker: Arc<dyn WorkerClient>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            cache,
            classifier,
            worker,
            config,
        }
    }

    pub fn memory(&self) -> &Arc<ConversationMemory> {
        &self.memory
    }

    pub fn cache(&self) -> &Arc<ShortTermCache> {
        &self.cache
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        if request.query.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "query must not be empty".to_string(),
            ));
        }

        let intent = self.resolve_intent(&request).await?;

        // The user turn is recorded after classification so the history
        // handed to the classifier does not contain the query twice.
        self.memory
            .append(&request.user_id, ConversationMessage::user(&request.query))
            .await;

        if intent.is_ambiguous {
            return Ok(self.request_clarification(&request, intent).await);
        }

        let candidates = candidate_ids(&intent);
        let target = match self.registry.first_healthy(&candidates) {
            Some(agent) => agent,
            None => {
                warn!(?candidates, "No healthy agent among candidates");
                return Err(DispatchError::NoHealthyAgent(candidates));
            }
        };
        if target.id != intent.agent_id {
            info!(
                classified = %intent.agent_id,
                selected = %target.id,
                "Primary choice unavailable, failing over"
            );
        }

        self.forward_and_record(&request, intent, target).await
    }

    /// Produce the intent for a request: explicit selection, best-effort
    /// fallback once the clarification budget is spent, or classification.
    async fn resolve_intent(
        &self,
        request: &DispatchRequest,
    ) -> Result<IntentResult, DispatchError> {
        if let Some(explicit) = request.explicit_agent_id.as_deref() {
            if !request.auto_route {
                if self.registry.get(explicit).is_none() {
                    return Err(DispatchError::UnknownAgent(explicit.to_string()));
                }
                return Ok(IntentResult::explicit(explicit));
            }
        }

        let history = self
            .memory
            .recent(&request.user_id, self.config.recent_lookback)
            .await;

        let rounds = consecutive_clarifications(&history);
        if rounds >= self.config.max_clarification_attempts {
            warn!(
                rounds,
                "Clarification budget exhausted, best-effort routing to '{}'",
                self.config.fallback_agent_id
            );
            return Ok(IntentResult {
                agent_id: self.config.fallback_agent_id.clone(),
                confidence: 0.5,
                reasoning: format!(
                    "clarification budget exhausted after {rounds} rounds, routing best-effort to the general-purpose agent"
                ),
                is_ambiguous: false,
                clarifying_questions: Vec::new(),
                extracted_params: Default::default(),
                alternative_agents: Vec::new(),
            });
        }

        let agents = self.registry.list();
        Ok(self
            .classifier
            .classify(&request.query, &history, &agents)
            .await)
    }

    /// Record the clarification turn and hand the questions back to the
    /// caller without touching any worker.
    async fn request_clarification(
        &self,
        request: &DispatchRequest,
        intent: IntentResult,
    ) -> DispatchOutcome {
        let questions = intent.clarifying_questions.clone();
        self.memory
            .append(
                &request.user_id,
                ConversationMessage::assistant(questions.join(" ")).with_intent(intent),
            )
            .await;

        let count = self
            .memory
            .consecutive_clarifications(&request.user_id, self.config.recent_lookback)
            .await;

        DispatchOutcome::ClarificationNeeded {
            clarifying_questions: questions,
            clarification_count: count,
            max_clarifications: self.config.max_clarification_attempts,
        }
    }

    /// Forward to the resolved agent and record the exchange. The forward
    /// runs on its own task: if the caller goes away mid-call the worker
    /// still completes and the records are kept, only the reply is dropped.
    async fn forward_and_record(
        &self,
        request: &DispatchRequest,
        intent: IntentResult,
        target: crate::registry::Agent,
    ) -> Result<DispatchOutcome, DispatchError> {
        let envelope = TaskEnvelope::new(
            &target.id,
            WorkerTask {
                name: "process_request".to_string(),
                parameters: json!({
                    "user_id": request.user_id,
                    "query": request.query,
                    "params": intent.extracted_params,
                }),
            },
        );
        let message_id = envelope.message_id.clone();

        let worker = self.worker.clone();
        let registry = self.registry.clone();
        let memory = self.memory.clone();
        let cache = self.cache.clone();
        let request = request.clone();
        let agent = target.clone();

        let handle = tokio::spawn(async move {
            match worker.forward(&agent, envelope).await {
                Ok(report) if report.status == ReportStatus::Failure => {
                    let message = report
                        .results
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("worker reported a failure")
                        .to_string();
                    memory
                        .append(
                            &request.user_id,
                            ConversationMessage::assistant(format!(
                                "Request to '{}' failed: {message}",
                                agent.id
                            ))
                            .with_agent(&agent.id)
                            .with_intent(intent),
                        )
                        .await;
                    Err(DispatchError::Forwarding {
                        agent_id: agent.id.clone(),
                        message,
                    })
                }
                Ok(report) => {
                    let response = report
                        .results
                        .get("output")
                        .cloned()
                        .unwrap_or_else(|| report.results.clone());
                    memory
                        .append(
                            &request.user_id,
                            ConversationMessage::assistant(response_text(&response))
                                .with_agent(&agent.id)
                                .with_intent(intent.clone()),
                        )
                        .await;
                    cache.record(
                        &agent.id,
                        CachedExchange {
                            message_id,
                            user_id: request.user_id.clone(),
                            query: request.query.clone(),
                            response: response.clone(),
                            timestamp: Utc::now(),
                        },
                    );
                    info!(agent_id = %agent.id, "Request dispatched");
                    Ok(DispatchOutcome::Dispatched {
                        agent_id: agent.id.clone(),
                        response,
                        confidence: intent.confidence,
                        reasoning: intent.reasoning,
                    })
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(agent_id = %agent.id, "Forwarding failed: {message}");
                    registry.mark_offline(&agent.id);
                    memory
                        .append(
                            &request.user_id,
                            ConversationMessage::assistant(format!(
                                "Could not reach agent '{}': {message}",
                                agent.id
                            ))
                            .with_agent(&agent.id)
                            .with_intent(intent),
                        )
                        .await;
                    Err(DispatchError::Forwarding {
                        agent_id: agent.id.clone(),
                        message,
                    })
                }
            }
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Forwarding task failed: {}", e);
                Err(DispatchError::Forwarding {
                    agent_id: target.id,
                    message: "internal forwarding task failure".to_string(),
                })
            }
        }
    }
}

/// Primary choice plus ranked alternatives, deduplicated in rank order.
fn candidate_ids(intent: &IntentResult) -> Vec<String> {
    let mut candidates = vec![intent.agent_id.clone()];
    for alternative in &intent.alternative_agents {
        if !candidates.contains(alternative) {
            candidates.push(alternative.clone());
        }
    }
    candidates
}

/// Flatten a worker response payload into conversation-log text.
fn response_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
