//! Agents and the LLM plumbing behind them.
//!
//! An [`Agent`] is a persona (name, role, goal, instructions) with a
//! conversation memory, answering tasks through an [`LlmClient`]. The client
//! dispatches to a provider backend and can parse structured (JSON) replies
//! for the orchestrator's planning prompts.

/// Agent persona and task execution.
pub mod agent;
/// Provider backends.
pub mod backends;
/// Model and provider configuration.
pub mod config;
/// Retry and failover across backends.
pub mod failover;
/// Provider-agnostic client.
pub mod llm;
/// Conversation memory.
pub mod memory;
/// JSON extraction from model replies.
pub mod structured;

pub use agent::{Agent, AgentConfig};
pub use backends::{LlmBackend, ScriptedBackend};
pub use config::{LlmProvider, ModelConfig};
pub use failover::{FailoverBackend, RetryPolicy};
pub use llm::{LlmClient, LlmResponse};
pub use memory::ConversationMemory;
pub use structured::{extract_json, parse_structured};
