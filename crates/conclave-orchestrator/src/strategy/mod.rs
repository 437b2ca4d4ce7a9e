mod llm;
mod random;
mod round_robin;

pub use llm::LlmStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;

use crate::plan::Verdict;
use crate::state::WorkflowInstance;
use async_trait::async_trait;
use conclave_bus::AgentMetadata;
use conclave_core::{BaseMessage, ConclaveResult};
use std::collections::BTreeMap;

/// Who speaks next, and about what.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Agent to trigger.
    pub agent: String,
    /// `None` lets the agent act on its memory.
    pub instruction: Option<String>,
    /// Plan step, for strategies that plan.
    pub step: Option<u32>,
    /// Plan substep, for strategies that plan.
    pub substep: Option<f64>,
}

impl Turn {
    /// A turn for `agent` without instruction.
    pub fn to(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            instruction: None,
            step: None,
            substep: None,
        }
    }

    /// Sets the instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

/// What a strategy sees of a running workflow.
pub struct TurnContext<'a> {
    /// The running instance; strategies may update its plan.
    pub instance: &'a mut WorkflowInstance,
    /// Agents available to this workflow, by name.
    pub agents: &'a BTreeMap<String, AgentMetadata>,
}

impl TurnContext<'_> {
    /// Task the workflow was started with.
    pub fn task(&self) -> &str {
        &self.instance.input
    }

    /// Current turn, 1-based.
    pub fn iteration(&self) -> u32 {
        self.instance.iteration
    }

    /// The agent that answered the previous turn.
    pub fn previous_speaker(&self) -> Option<&str> {
        self.instance.task_history.last().map(|t| t.agent.as_str())
    }
}

/// Decides the speaking order of a workflow.
#[async_trait]
pub trait SpeakerStrategy: Send + Sync {
    /// Short name used in logs and config (`random`, `round_robin`, `llm`).
    fn name(&self) -> &'static str;

    /// Runs once before the first turn. A returned message is broadcast to the team.
    async fn prepare(&self, _ctx: &mut TurnContext<'_>) -> ConclaveResult<Option<BaseMessage>> {
        Ok(None)
    }

    /// Picks the agent for the current turn and what it should do.
    async fn next_turn(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Turn>;

    /// Judges the workflow after `response`.
    async fn observe(
        &self,
        _ctx: &mut TurnContext<'_>,
        _response: &BaseMessage,
    ) -> ConclaveResult<Verdict> {
        Ok(Verdict::Continue)
    }

    /// Produces the workflow output. `verdict` is `None` when the iteration
    /// budget ran out.
    async fn finalize(
        &self,
        ctx: &mut TurnContext<'_>,
        _verdict: Option<Verdict>,
    ) -> ConclaveResult<String> {
        Ok(ctx
            .instance
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

/// Boxed strategies are strategies too, so the kind can be picked at runtime.
#[async_trait]
impl SpeakerStrategy for Box<dyn SpeakerStrategy> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn prepare(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Option<BaseMessage>> {
        (**self).prepare(ctx).await
    }

    async fn next_turn(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Turn> {
        (**self).next_turn(ctx).await
    }

    async fn observe(
        &self,
        ctx: &mut TurnContext<'_>,
        response: &BaseMessage,
    ) -> ConclaveResult<Verdict> {
        (**self).observe(ctx, response).await
    }

    async fn finalize(
        &self,
        ctx: &mut TurnContext<'_>,
        verdict: Option<Verdict>,
    ) -> ConclaveResult<String> {
        (**self).finalize(ctx, verdict).await
    }
}
