use super::{SpeakerStrategy, Turn, TurnContext};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};

/// Cycles through the agents in name order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinStrategy;

impl RoundRobinStrategy {
    /// Round-robin strategy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpeakerStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn next_turn(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Turn> {
        // BTreeMap keys are already sorted by name
        let names: Vec<&String> = ctx.agents.keys().collect();
        if names.is_empty() {
            return Err(ConclaveError::Orchestrator("no agents available".into()));
        }
        let index = (ctx.iteration().max(1) as usize - 1) % names.len();
        let turn = Turn::to(names[index].clone());
        Ok(if ctx.iteration() <= 1 {
            turn.with_instruction(ctx.task().to_string())
        } else {
            turn
        })
    }
}
