//! Workflow orchestration for teams of Conclave agents.
//!
//! An [`Orchestrator`] never does the work itself. It broadcasts the task,
//! asks a [`SpeakerStrategy`] who speaks next, triggers that agent over the
//! bus and shares the answer with the whole team. Every step is persisted
//! as a [`WorkflowInstance`] so a run can be inspected afterwards.
//!
//! # Main types
//!
//! - [`Orchestrator`]: The control loop driving one workflow at a time.
//! - [`SpeakerStrategy`]: Picks the next speaker ([`RandomStrategy`], [`RoundRobinStrategy`], [`LlmStrategy`]).
//! - [`TaskPlan`]: Step/substep plan kept by the LLM strategy, with atomic status updates.
//! - [`WorkflowStore`]: Persists workflow instances in a shared state store.
//! - [`AgentMonitor`]: Per-agent turn, timeout and latency tracking.

/// The orchestration control loop.
pub mod engine;
/// Agent activity monitoring.
pub mod monitor;
/// Task plans and progress-check models.
pub mod plan;
/// Prompt templates for the LLM strategy.
pub mod prompts;
/// JSON schemas for structured replies.
pub mod schemas;
/// Workflow instances and their persistence.
pub mod state;
/// Speaker selection strategies.
pub mod strategy;

pub use engine::{timeout_message, Orchestrator, OrchestratorConfig, WorkflowOutcome};
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, WorkerStatus};
pub use plan::{
    NextStep, PlanStatusUpdate, PlanStep, ProgressCheckOutput, StepStatus, SubStep, TaskPlan,
    Verdict,
};
pub use state::{TaskResult, WorkflowInstance, WorkflowState, WorkflowStatus, WorkflowStore};
pub use strategy::{
    LlmStrategy, RandomStrategy, RoundRobinStrategy, SpeakerStrategy, Turn, TurnContext,
};
