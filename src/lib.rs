//! Switchboard - Dispatch Engine
//!
//! The control plane of a multi-agent orchestration service: classifies
//! free-text requests onto independently deployed worker agents, asks for
//! clarification when a request is too ambiguous to route, fails over to
//! healthy alternatives, and keeps per-user conversational state.

pub mod classifier;
pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod registry;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use registry::AgentRegistry;
