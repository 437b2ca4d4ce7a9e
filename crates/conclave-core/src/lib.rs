//! Core types and error definitions for the Conclave multi-agent framework.
//!
//! This crate provides the foundational types shared across all Conclave crates:
//! error handling, the messages agents and orchestrators exchange, and the
//! CloudEvents-shaped envelope those messages travel in over the bus.
//!
//! # Main types
//!
//! - [`ConclaveError`]: Unified error enum for all Conclave subsystems.
//! - [`ConclaveResult`]: Convenience alias for `Result<T, ConclaveError>`.
//! - [`BaseMessage`]: A role-tagged chat message.
//! - [`AgentTaskResponse`]: An agent's reply after completing a task.
//! - [`TriggerAction`]: Tells an agent to start working.
//! - [`EventEnvelope`]: Transport wrapper for every message on the bus.

/// Error types.
pub mod error;
/// Bus envelope and the [`EventMessage`] trait.
pub mod event;
/// Message payloads exchanged during a workflow.
pub mod message;

pub use error::{ConclaveError, ConclaveResult};
pub use event::{EventEnvelope, EventMessage};
pub use message::{AgentTaskResponse, BaseMessage, MessageRole, TriggerAction};
