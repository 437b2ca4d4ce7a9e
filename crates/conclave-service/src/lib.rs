//! Hosting for Conclave agents.
//!
//! An [`AgentService`] puts an agent on the message bus: it registers the
//! agent, runs the tasks it is triggered with and keeps its memory in sync
//! with the team. [`server::router`] exposes the same service over HTTP,
//! including the endpoint remote buses deliver events to.

/// Topic and address settings.
pub mod config;
/// Outbound messaging shared by agents and orchestrators.
pub mod messenger;
/// HTTP routes.
pub mod server;
/// Bus-side agent hosting.
pub mod service;

pub use config::{dead_letter_topic, ServiceConfig, DEFAULT_BROADCAST_TOPIC, DEFAULT_TASK_RESULTS_TOPIC};
pub use messenger::{Messenger, WORKFLOW_INSTANCE_KEY};
pub use server::{bind_and_serve, router, serve};
pub use service::{AgentService, ServiceHandle};
