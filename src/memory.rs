//! Per-user conversation memory and the short-term dispatch cache.
//!
//! Both stores are process-local: a restart loses all conversational context,
//! which is a documented property of the service rather than a defect.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::classifier::IntentResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single conversation turn. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_info: Option<IntentResult>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            agent_id: None,
            intent_info: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            agent_id: None,
            intent_info: None,
        }
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_intent(mut self, intent: IntentResult) -> Self {
        self.intent_info = Some(intent);
        self
    }

    fn is_ambiguous_turn(&self) -> bool {
        self.intent_info.as_ref().map_or(false, |intent| intent.is_ambiguous)
    }
}

/// Trailing run of ambiguous assistant turns, newest first.
///
/// A resolved assistant turn ends the run; interleaved user messages do not.
pub fn consecutive_clarifications(messages: &[ConversationMessage]) -> usize {
    messages
        .iter()
        .rev()
        .filter_map(|message| match (message.role, &message.intent_info) {
            (Role::Assistant, Some(intent)) => Some(intent.is_ambiguous),
            _ => None,
        })
        .take_while(|ambiguous| *ambiguous)
        .count()
}

/// Bounded per-user log of exchanged messages and routing metadata.
///
/// Each user's history sits behind its own mutex, so appends and reads for
/// one user are serialized while different users proceed fully in parallel.
pub struct ConversationMemory {
    histories: DashMap<String, Arc<Mutex<VecDeque<ConversationMessage>>>>,
    max_per_user: usize,
}

impl ConversationMemory {
    pub fn new(max_per_user: usize) -> Self {
        Self {
            histories: DashMap::new(),
            max_per_user,
        }
    }

    fn history_for(&self, user_id: &str) -> Arc<Mutex<VecDeque<ConversationMessage>>> {
        self.histories
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Append a message, evicting the oldest entry once the per-user bound
    /// is exceeded.
    pub async fn append(&self, user_id: &str, message: ConversationMessage) {
        let history = self.history_for(user_id);
        let mut guard = history.lock().await;
        while guard.len() >= self.max_per_user {
            debug!("History at capacity for user, evicting oldest message");
            guard.pop_front();
        }
        guard.push_back(message);
    }

    /// Last `limit` messages in chronological order; empty for unknown users.
    pub async fn recent(&self, user_id: &str, limit: usize) -> Vec<ConversationMessage> {
        let history = match self.histories.get(user_id) {
            Some(entry) => entry.value().clone(),
            None => return Vec::new(),
        };
        let guard = history.lock().await;
        let mut messages: Vec<ConversationMessage> =
            guard.iter().rev().take(limit).cloned().collect();
        messages.reverse();
        messages
    }

    /// Fraction of the last `lookback` messages flagged ambiguous by their
    /// classification. Used to detect stuck conversations.
    pub async fn clarification_pressure(&self, user_id: &str, lookback: usize) -> f64 {
        let recent = self.recent(user_id, lookback).await;
        if recent.is_empty() {
            return 0.0;
        }
        let ambiguous = recent.iter().filter(|m| m.is_ambiguous_turn()).count();
        ambiguous as f64 / recent.len() as f64
    }

    /// Clarification rounds still unanswered, recomputed from history.
    pub async fn consecutive_clarifications(&self, user_id: &str, lookback: usize) -> usize {
        let recent = self.recent(user_id, lookback).await;
        consecutive_clarifications(&recent)
    }

    pub async fn clear(&self, user_id: &str) {
        self.histories.remove(user_id);
        debug!("Cleared conversation history for user");
    }
}

/// One dispatched exchange kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CachedExchange {
    pub message_id: String,
    pub user_id: String,
    pub query: String,
    pub response: Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent bounded FIFO of recent (request, response) pairs.
///
/// Diagnostics only: nothing in the dispatch path reads it back.
pub struct ShortTermCache {
    entries: DashMap<String, VecDeque<CachedExchange>>,
    capacity: usize,
}

impl ShortTermCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn record(&self, agent_id: &str, exchange: CachedExchange) {
        let mut queue = self.entries.entry(agent_id.to_string()).or_default();
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(exchange);
    }

    pub fn recent(&self, agent_id: &str) -> Vec<CachedExchange> {
        self.entries
            .get(agent_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn intent(is_ambiguous: bool) -> IntentResult {
        IntentResult {
            agent_id: "quiz_master".to_string(),
            confidence: if is_ambiguous { 0.3 } else { 0.9 },
            reasoning: "test".to_string(),
            is_ambiguous,
            clarifying_questions: vec![],
            extracted_params: Default::default(),
            alternative_agents: vec![],
        }
    }

    #[tokio::test]
    async fn history_evicts_oldest_first() {
        let memory = ConversationMemory::new(3);
        for i in 0..5 {
            memory.append("u1", ConversationMessage::user(format!("m{i}"))).await;
        }

        let all = memory.recent("u1", 10).await;
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn recent_returns_chronological_tail() {
        let memory = ConversationMemory::new(10);
        for i in 0..4 {
            memory.append("u1", ConversationMessage::user(format!("m{i}"))).await;
        }

        let tail = memory.recent("u1", 2).await;
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn recent_is_empty_for_unknown_user() {
        let memory = ConversationMemory::new(10);
        assert!(memory.recent("nobody", 5).await.is_empty());
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let memory = ConversationMemory::new(10);
        memory.append("a", ConversationMessage::user("from a")).await;
        memory.append("b", ConversationMessage::user("from b")).await;

        assert_eq!(memory.recent("a", 10).await.len(), 1);
        assert_eq!(memory.recent("b", 10).await.len(), 1);

        memory.clear("a").await;
        assert!(memory.recent("a", 10).await.is_empty());
        assert_eq!(memory.recent("b", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn pressure_counts_ambiguous_turns() {
        let memory = ConversationMemory::new(10);
        memory.append("u1", ConversationMessage::user("hi")).await;
        memory
            .append("u1", ConversationMessage::assistant("which?").with_intent(intent(true)))
            .await;
        memory.append("u1", ConversationMessage::user("the second one")).await;
        memory
            .append("u1", ConversationMessage::assistant("done").with_intent(intent(false)))
            .await;

        let pressure = memory.clarification_pressure("u1", 10).await;
        assert!((pressure - 0.25).abs() < 1e-9);
        assert_eq!(memory.clarification_pressure("nobody", 10).await, 0.0);
    }

    #[tokio::test]
    async fn clarification_run_stops_at_resolved_turn() {
        let memory = ConversationMemory::new(20);
        memory
            .append("u1", ConversationMessage::assistant("which?").with_intent(intent(true)))
            .await;
        memory
            .append("u1", ConversationMessage::assistant("ok").with_intent(intent(false)))
            .await;
        memory
            .append("u1", ConversationMessage::assistant("which?").with_intent(intent(true)))
            .await;
        memory.append("u1", ConversationMessage::user("hmm")).await;
        memory
            .append("u1", ConversationMessage::assistant("which one?").with_intent(intent(true)))
            .await;

        // Two trailing ambiguous turns; the resolved turn before them ends
        // the run even with a user message interleaved.
        assert_eq!(memory.consecutive_clarifications("u1", 10).await, 2);
    }

    #[tokio::test]
    async fn same_user_appends_keep_arrival_order() {
        let memory = Arc::new(ConversationMemory::new(100));
        for i in 0..20 {
            memory.append("u1", ConversationMessage::user(format!("m{i}"))).await;
        }
        let all = memory.recent("u1", 100).await;
        for (i, message) in all.iter().enumerate() {
            assert_eq!(message.content, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn short_term_cache_is_bounded_fifo() {
        let cache = ShortTermCache::new(2);
        for i in 0..3 {
            cache.record(
                "quiz_master",
                CachedExchange {
                    message_id: format!("id{i}"),
                    user_id: "u1".to_string(),
                    query: format!("q{i}"),
                    response: json!({"output": i}),
                    timestamp: Utc::now(),
                },
            );
        }

        let recent = cache.recent("quiz_master");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query, "q1");
        assert_eq!(recent[1].query, "q2");
        assert!(cache.recent("unseen").is_empty());
    }

    proptest! {
        #[test]
        fn history_bound_holds_for_any_append_sequence(
            contents in proptest::collection::vec("[a-z]{0,12}", 0..40),
            cap in 1usize..8,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let got: Vec<String> = rt.block_on(async {
                let memory = ConversationMemory::new(cap);
                for content in &contents {
                    memory.append("u", ConversationMessage::user(content.as_str())).await;
                }
                memory
                    .recent("u", usize::MAX)
                    .await
                    .into_iter()
                    .map(|m| m.content)
                    .collect()
            });

            let expected: Vec<String> =
                contents.iter().rev().take(cap).rev().cloned().collect();
            prop_assert!(got.len() <= cap);
            prop_assert_eq!(got, expected);
        }
    }
}
