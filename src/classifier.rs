//! Intent classification: a probabilistic reasoning call backed by a
//! deterministic keyword fallback.
//!
//! `classify` never fails. Whatever the external model does — time out,
//! return prose instead of JSON, hallucinate an agent id — the caller always
//! receives a well-formed [`IntentResult`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::memory::{ConversationMessage, Role};
use crate::registry::Agent;

/// Routing decision for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub agent_id: String,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub is_ambiguous: bool,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    #[serde(default)]
    pub extracted_params: HashMap<String, Value>,
    #[serde(default)]
    pub alternative_agents: Vec<String>,
}

impl IntentResult {
    /// Sole-candidate result for an explicitly selected agent.
    pub fn explicit(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            confidence: 1.0,
            reasoning: "explicit selection".to_string(),
            is_ambiguous: false,
            clarifying_questions: Vec::new(),
            extracted_params: HashMap::new(),
            alternative_agents: Vec::new(),
        }
    }
}

/// External reasoning capability behind an interface, so the classifier can
/// be exercised without a live model.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

/// Reasoning client speaking the OpenAI-compatible chat completion protocol.
pub struct HttpReasoningClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpReasoningClient {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            model,
            api_key,
            http,
        })
    }
}

#[async_trait]
impl ReasoningClient for HttpReasoningClient {
    #[instrument(skip(self, prompt), fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("reasoning call failed with status {status}"));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("reasoning reply contained no choices"))
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub fallback_agent_id: String,
    /// Above this the query is confidently routed; the fallback path asks for
    /// clarification below it.
    pub confidence_threshold: f64,
    /// Hard floor: any result below this is forced ambiguous.
    pub min_acceptable_confidence: f64,
    /// Conversation turns included as model context.
    pub context_turns: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            fallback_agent_id: "general_assistant".to_string(),
            confidence_threshold: 0.70,
            min_acceptable_confidence: 0.50,
            context_turns: 5,
        }
    }
}

/// Turns a user query plus conversation context into a routing decision.
pub struct IntentClassifier {
    client: Arc<dyn ReasoningClient>,
    config: ClassifierConfig,
}

impl IntentClassifier {
    pub fn new(client: Arc<dyn ReasoningClient>, config: ClassifierConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    #[instrument(skip(self, query, history, agents), fields(history_len = history.len()))]
    pub async fn classify(
        &self,
        query: &str,
        history: &[ConversationMessage],
        agents: &[Agent],
    ) -> IntentResult {
        let prompt = self.build_prompt(query, history, agents);

        match self.client.complete(&prompt).await {
            Ok(raw) => match self.parse_reply(&raw, agents) {
                Ok(intent) => {
                    let intent = self.enforce_thresholds(intent);
                    info!(
                        agent_id = %intent.agent_id,
                        confidence = intent.confidence,
                        "Intent identified"
                    );
                    intent
                }
                Err(e) => {
                    warn!("Reasoning reply was not usable ({e}), using keyword fallback");
                    self.keyword_fallback(query, agents)
                }
            },
            Err(e) => {
                warn!("Reasoning call failed ({e}), using keyword fallback");
                self.keyword_fallback(query, agents)
            }
        }
    }

    fn build_agent_catalogue(&self, agents: &[Agent]) -> String {
        let mut catalogue = String::from("Available agents:\n\n");
        for agent in agents {
            let _ = writeln!(catalogue, "Agent ID: {}", agent.id);
            let _ = writeln!(catalogue, "Name: {}", agent.name);
            let _ = writeln!(catalogue, "Description: {}", agent.description);
            let _ = writeln!(catalogue, "Capabilities: {}", agent.capabilities.join(", "));
            if !agent.keywords.is_empty() {
                let _ = writeln!(catalogue, "Keywords: {}", agent.keywords.join(", "));
            }
            catalogue.push('\n');
        }
        catalogue
    }

    fn build_prompt(
        &self,
        query: &str,
        history: &[ConversationMessage],
        agents: &[Agent],
    ) -> String {
        let catalogue = self.build_agent_catalogue(agents);

        let mut history_context = String::new();
        let turns = history.len().saturating_sub(self.config.context_turns);
        if !history.is_empty() {
            history_context.push_str("### Conversation history (most recent turns):\n");
            for message in &history[turns..] {
                let role = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                let _ = writeln!(history_context, "{}: {}", role, message.content);
            }
            history_context
                .push_str("\nUse this history to better understand the current query.\n");
        }

        format!(
            r#"You are an expert intent classifier for a multi-agent system. Analyze the user query and decide which agent should handle it.

{catalogue}
{history_context}
### Current user query:
"{query}"

### Response format:
Respond with ONLY a JSON object in this exact format (no markdown, no backticks):

{{
    "agent_id": "exact_agent_id_from_list_above",
    "confidence": 0.95,
    "reasoning": "why this agent was chosen",
    "is_ambiguous": false,
    "clarifying_questions": [],
    "extracted_params": {{}},
    "alternative_agents": []
}}

### Rules:
1. High confidence (0.8-1.0): the query clearly matches one agent's primary function.
2. Medium confidence (0.5-0.79): the query matches but is missing details, or could match several agents; list alternatives.
3. Low confidence (below 0.5): the query is vague; set "is_ambiguous" to true and provide 2-3 specific clarifying questions.
4. Match query keywords against agent keywords, query intent against agent descriptions, and query actions against agent capabilities. Use "{fallback}" for general queries no specialist covers.
5. Extract every relevant parameter mentioned in the query (topics, quantities, formats, deadlines) into extracted_params.
6. Rank alternative_agents by suitability, best first.

Now analyze the current user query and respond with the JSON object."#,
            fallback = self.config.fallback_agent_id,
        )
    }

    fn parse_reply(&self, raw: &str, agents: &[Agent]) -> Result<IntentResult> {
        let cleaned = strip_code_fences(raw);
        let mut intent: IntentResult = serde_json::from_str(cleaned)?;

        if !agents.iter().any(|agent| agent.id == intent.agent_id) {
            warn!(
                "Classifier chose unknown agent '{}', rerouting to '{}'",
                intent.agent_id, self.config.fallback_agent_id
            );
            intent.agent_id = self.config.fallback_agent_id.clone();
            intent.confidence = intent.confidence.min(0.5);
            intent
                .reasoning
                .push_str(" (chosen agent not in registry, rerouted to the general-purpose fallback)");
        }

        Ok(intent)
    }

    fn enforce_thresholds(&self, mut intent: IntentResult) -> IntentResult {
        intent.confidence = intent.confidence.clamp(0.0, 1.0);
        if intent.confidence < self.config.min_acceptable_confidence {
            intent.is_ambiguous = true;
            if intent.clarifying_questions.is_empty() {
                intent.clarifying_questions = vec![
                    "Could you provide more details about what you need help with?".to_string(),
                    "What subject or topic are you working on?".to_string(),
                    "What is your main goal right now?".to_string(),
                ];
            }
        }
        intent
    }

    /// Deterministic fallback: score every agent by keyword hits in the
    /// lowercased query and pick the best scorer.
    fn keyword_fallback(&self, query: &str, agents: &[Agent]) -> IntentResult {
        let query_lower = query.to_lowercase();

        let mut best: Option<(&Agent, usize)> = None;
        for agent in agents {
            let hits = agent
                .keywords
                .iter()
                .filter(|keyword| query_lower.contains(&keyword.to_lowercase()))
                .count();
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((agent, hits));
            }
        }

        let intent = match best {
            Some((agent, hits)) => {
                let confidence = (0.2 * hits as f64).min(0.7);
                let is_ambiguous = confidence < self.config.confidence_threshold;
                IntentResult {
                    agent_id: agent.id.clone(),
                    confidence,
                    reasoning: format!(
                        "keyword fallback matched {hits} keyword(s) for '{}'",
                        agent.id
                    ),
                    is_ambiguous,
                    clarifying_questions: if is_ambiguous {
                        vec![
                            "Could you provide more details about your request?".to_string(),
                            "What specific help do you need?".to_string(),
                        ]
                    } else {
                        Vec::new()
                    },
                    extracted_params: HashMap::new(),
                    alternative_agents: Vec::new(),
                }
            }
            None => IntentResult {
                agent_id: self.config.fallback_agent_id.clone(),
                confidence: 0.3,
                reasoning: "no keyword matches, routing to the general-purpose agent".to_string(),
                is_ambiguous: true,
                clarifying_questions: vec![
                    "What would you like help with?".to_string(),
                    "Could you describe your task in more detail?".to_string(),
                ],
                extracted_params: HashMap::new(),
                alternative_agents: Vec::new(),
            },
        };

        self.enforce_thresholds(intent)
    }
}

/// Strip a leading/trailing markdown code fence from a model reply.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}
