//! Caller-visible error taxonomy of the dispatch engine.

use thiserror::Error;

/// Errors that are surfaced to the caller of a dispatch request.
///
/// Classification failures never appear here: the classifier always recovers
/// locally through keyword matching and returns a usable result.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("agent '{0}' not found in registry")]
    UnknownAgent(String),

    #[error("no healthy agent among candidates {0:?}")]
    NoHealthyAgent(Vec<String>),

    #[error("forwarding to agent '{agent_id}' failed: {message}")]
    Forwarding { agent_id: String, message: String },
}

impl DispatchError {
    /// Stable machine-readable code included in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownAgent(_) => "unknown_agent",
            Self::NoHealthyAgent(_) => "no_healthy_agent",
            Self::Forwarding { .. } => "forward_failed",
        }
    }
}
