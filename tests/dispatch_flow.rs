//! End-to-end tests for the dispatch engine.
//!
//! These exercise the full control plane — classification with fallback,
//! clarification rounds, health-based failover and conversation bookkeeping —
//! against scripted reasoning and worker doubles, the same seams the
//! production HTTP clients plug into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing_test::traced_test;

use switchboard::classifier::{ClassifierConfig, IntentClassifier, ReasoningClient};
use switchboard::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, DispatcherConfig};
use switchboard::error::DispatchError;
use switchboard::memory::{ConversationMemory, Role, ShortTermCache};
use switchboard::registry::{Agent, AgentRegistry, AgentStatus};
use switchboard::worker::{CompletionReport, ReportStatus, TaskEnvelope, WorkerClient};

/// Reasoning double that replays a fixed reply (or fails) and counts calls.
struct ScriptedReasoning {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedReasoning {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningClient for ScriptedReasoning {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => Err(anyhow!("reasoning backend unavailable")),
        }
    }
}

/// Worker double with per-agent reachability and recorded envelopes.
struct FakeWorkers {
    statuses: HashMap<String, AgentStatus>,
    forwarded: Mutex<Vec<String>>,
}

impl FakeWorkers {
    fn healthy(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            statuses: ids
                .iter()
                .map(|id| (id.to_string(), AgentStatus::Healthy))
                .collect(),
            forwarded: Mutex::new(Vec::new()),
        })
    }

    fn forwarded_to(&self) -> Vec<String> {
        self.forwarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerClient for FakeWorkers {
    async fn probe_health(&self, agent: &Agent) -> AgentStatus {
        self.statuses
            .get(&agent.id)
            .copied()
            .unwrap_or(AgentStatus::Offline)
    }

    async fn forward(&self, agent: &Agent, envelope: TaskEnvelope) -> Result<CompletionReport> {
        self.forwarded.lock().unwrap().push(agent.id.clone());
        Ok(CompletionReport {
            message_id: format!("report-{}", envelope.message_id),
            sender: agent.id.clone(),
            recipient: envelope.sender.clone(),
            kind: "completion_report".to_string(),
            related_message_id: envelope.message_id,
            status: ReportStatus::Success,
            results: json!({"output": format!("{} handled it", agent.id)}),
            timestamp: Utc::now(),
        })
    }
}

fn agent(id: &str, keywords: &[&str]) -> Agent {
    Agent {
        id: id.to_string(),
        name: id.to_string(),
        description: format!("{id} worker"),
        capabilities: vec![],
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        url: format!("http://127.0.0.1:9999/{id}"),
        status: AgentStatus::Unknown,
    }
}

fn standard_agents() -> Vec<Agent> {
    vec![
        agent("quiz_master", &["quiz", "question"]),
        agent("research_scout", &["paper", "research"]),
        agent("general_assistant", &[]),
    ]
}

fn build_engine(
    reasoning: Arc<ScriptedReasoning>,
    workers: Arc<FakeWorkers>,
) -> (Dispatcher, Arc<AgentRegistry>) {
    let registry = Arc::new(AgentRegistry::from_agents(standard_agents()).unwrap());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        Arc::new(ConversationMemory::new(50)),
        Arc::new(ShortTermCache::new(20)),
        IntentClassifier::new(reasoning, ClassifierConfig::default()),
        workers,
        DispatcherConfig::default(),
    );
    (dispatcher, registry)
}

fn request(user: &str, query: &str) -> DispatchRequest {
    DispatchRequest {
        user_id: user.to_string(),
        query: query.to_string(),
        explicit_agent_id: None,
        auto_route: false,
    }
}

const QUIZ_REPLY: &str = r#"{"agent_id":"quiz_master","confidence":0.9,"reasoning":"quiz request","is_ambiguous":false,"clarifying_questions":[],"extracted_params":{"topic":"rust"},"alternative_agents":["general_assistant"]}"#;

const VAGUE_REPLY: &str = r#"{"agent_id":"general_assistant","confidence":0.3,"reasoning":"vague","is_ambiguous":true,"clarifying_questions":["What subject?","What kind of help?"],"extracted_params":{},"alternative_agents":[]}"#;

#[tokio::test]
#[traced_test]
async fn startup_probe_round_marks_reachable_agents() {
    let workers = FakeWorkers::healthy(&["quiz_master", "general_assistant"]);
    let (_, registry) = build_engine(ScriptedReasoning::replying(QUIZ_REPLY), workers.clone());

    registry.health_check(workers.as_ref()).await;

    assert_eq!(registry.status("quiz_master"), Some(AgentStatus::Healthy));
    assert_eq!(registry.status("research_scout"), Some(AgentStatus::Offline));
    assert_eq!(
        registry.status("general_assistant"),
        Some(AgentStatus::Healthy)
    );
}

#[tokio::test]
#[traced_test]
async fn confident_request_is_dispatched_end_to_end() {
    let workers = FakeWorkers::healthy(&["quiz_master", "general_assistant"]);
    let (dispatcher, registry) =
        build_engine(ScriptedReasoning::replying(QUIZ_REPLY), workers.clone());
    registry.health_check(workers.as_ref()).await;

    let outcome = dispatcher
        .dispatch(request("alice", "Generate a quiz about Rust"))
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Dispatched {
            agent_id,
            response,
            confidence,
            ..
        } => {
            assert_eq!(agent_id, "quiz_master");
            assert_eq!(response, json!("quiz_master handled it"));
            assert!((confidence - 0.9).abs() < 1e-9);
        }
        other => panic!("expected dispatch, got {other:?}"),
    }

    assert_eq!(workers.forwarded_to(), vec!["quiz_master"]);

    // One user turn, one assistant turn tagged with the handling agent.
    let history = dispatcher.memory().recent("alice", 10).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].agent_id.as_deref(), Some("quiz_master"));
    assert!(history[1].intent_info.is_some());

    let cached = dispatcher.cache().recent("quiz_master");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].user_id, "alice");
}

#[tokio::test]
#[traced_test]
async fn offline_primary_fails_over_to_ranked_alternative() {
    let workers = FakeWorkers::healthy(&["general_assistant"]);
    let (dispatcher, registry) =
        build_engine(ScriptedReasoning::replying(QUIZ_REPLY), workers.clone());
    registry.health_check(workers.as_ref()).await;
    assert_eq!(registry.status("quiz_master"), Some(AgentStatus::Offline));

    let outcome = dispatcher
        .dispatch(request("alice", "Generate a quiz about Rust"))
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Dispatched { agent_id, .. } => {
            assert_eq!(agent_id, "general_assistant");
        }
        other => panic!("expected dispatch, got {other:?}"),
    }

    // History records the agent actually used, not the classified one.
    let history = dispatcher.memory().recent("alice", 10).await;
    assert_eq!(
        history.last().unwrap().agent_id.as_deref(),
        Some("general_assistant")
    );
}

#[tokio::test]
#[traced_test]
async fn clarification_loop_is_bounded_then_degrades_to_routing() {
    let workers = FakeWorkers::healthy(&["quiz_master", "general_assistant"]);
    let reasoning = ScriptedReasoning::replying(VAGUE_REPLY);
    let (dispatcher, registry) = build_engine(reasoning.clone(), workers.clone());
    registry.health_check(workers.as_ref()).await;

    for round in 1..=3usize {
        let outcome = dispatcher.dispatch(request("bob", "help me")).await.unwrap();
        match outcome {
            DispatchOutcome::ClarificationNeeded {
                clarifying_questions,
                clarification_count,
                max_clarifications,
            } => {
                assert_eq!(clarifying_questions.len(), 2);
                assert_eq!(clarification_count, round);
                assert_eq!(max_clarifications, 3);
            }
            other => panic!("round {round}: expected clarification, got {other:?}"),
        }
        assert!(workers.forwarded_to().is_empty());
    }

    // Fourth request: classifier is bypassed, fallback agent gets the task.
    let outcome = dispatcher.dispatch(request("bob", "help me")).await.unwrap();
    match outcome {
        DispatchOutcome::Dispatched { agent_id, .. } => {
            assert_eq!(agent_id, "general_assistant");
        }
        other => panic!("expected dispatch, got {other:?}"),
    }
    assert_eq!(reasoning.call_count(), 3);
    assert_eq!(workers.forwarded_to(), vec!["general_assistant"]);

    // A fresh user is unaffected by bob's exhausted budget.
    let outcome = dispatcher.dispatch(request("carol", "help me")).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::ClarificationNeeded { .. }));
}

#[tokio::test]
#[traced_test]
async fn classifier_outage_falls_back_to_keywords_with_floor_override() {
    let workers = FakeWorkers::healthy(&["quiz_master", "general_assistant"]);
    let (dispatcher, registry) =
        build_engine(ScriptedReasoning::unavailable(), workers.clone());
    registry.health_check(workers.as_ref()).await;

    // Two keyword hits score 0.4, below the acceptance floor, so the engine
    // must ask for clarification instead of dispatching.
    let outcome = dispatcher
        .dispatch(request("dave", "Generate a quiz with 5 questions"))
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::ClarificationNeeded {
            clarifying_questions,
            ..
        } => assert!(!clarifying_questions.is_empty()),
        other => panic!("expected clarification, got {other:?}"),
    }
    assert!(workers.forwarded_to().is_empty());

    let history = dispatcher.memory().recent("dave", 10).await;
    let intent = history
        .last()
        .unwrap()
        .intent_info
        .as_ref()
        .expect("clarification turn carries its intent");
    assert_eq!(intent.agent_id, "quiz_master");
    assert!((intent.confidence - 0.4).abs() < 1e-9);
    assert!(intent.is_ambiguous);
}

#[tokio::test]
#[traced_test]
async fn every_candidate_offline_is_a_structured_error() {
    let workers = FakeWorkers::healthy(&[]);
    let (dispatcher, registry) =
        build_engine(ScriptedReasoning::replying(QUIZ_REPLY), workers.clone());
    registry.health_check(workers.as_ref()).await;

    let err = dispatcher
        .dispatch(request("erin", "Generate a quiz about Rust"))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::NoHealthyAgent(_)));
    assert!(workers.forwarded_to().is_empty());

    // Nothing in history claims a successful dispatch.
    let history = dispatcher.memory().recent("erin", 10).await;
    assert!(history.iter().all(|m| m.role == Role::User));
}

#[tokio::test]
#[traced_test]
async fn explicit_selection_never_touches_the_classifier() {
    let workers = FakeWorkers::healthy(&["research_scout"]);
    let reasoning = ScriptedReasoning::replying(QUIZ_REPLY);
    let (dispatcher, registry) = build_engine(reasoning.clone(), workers.clone());
    registry.health_check(workers.as_ref()).await;

    let mut req = request("frank", "generate a quiz with many questions");
    req.explicit_agent_id = Some("research_scout".to_string());
    req.auto_route = false;

    let outcome = dispatcher.dispatch(req).await.unwrap();
    match outcome {
        DispatchOutcome::Dispatched {
            agent_id,
            confidence,
            reasoning: why,
            ..
        } => {
            assert_eq!(agent_id, "research_scout");
            assert_eq!(confidence, 1.0);
            assert_eq!(why, "explicit selection");
        }
        other => panic!("expected dispatch, got {other:?}"),
    }
    assert_eq!(reasoning.call_count(), 0);
    assert_eq!(workers.forwarded_to(), vec!["research_scout"]);
}

#[tokio::test]
#[traced_test]
async fn users_route_independently_and_in_parallel() {
    let workers = FakeWorkers::healthy(&["quiz_master", "general_assistant"]);
    let (dispatcher, registry) =
        build_engine(ScriptedReasoning::replying(QUIZ_REPLY), workers.clone());
    registry.health_check(workers.as_ref()).await;
    let dispatcher = Arc::new(dispatcher);

    let mut handles = Vec::new();
    for user in ["u1", "u2", "u3", "u4"] {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch(request(user, "quiz me on something"))
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    for user in ["u1", "u2", "u3", "u4"] {
        let history = dispatcher.memory().recent(user, 10).await;
        assert_eq!(history.len(), 2);
    }
}
