use super::{SpeakerStrategy, Turn, TurnContext};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};
use rand::seq::SliceRandom;
use tracing::debug;

/// Picks a random agent each turn, never the previous speaker when there
/// is a choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl RandomStrategy {
    /// Random strategy.
    pub fn new() -> Self {
        Self
    }
}

fn pick(candidates: &[&str]) -> Option<String> {
    candidates
        .choose(&mut rand::thread_rng())
        .map(|name| name.to_string())
}

#[async_trait]
impl SpeakerStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn next_turn(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Turn> {
        let previous = ctx.previous_speaker();
        let mut candidates: Vec<&str> = ctx.agents.keys().map(String::as_str).collect();
        if candidates.len() > 1 {
            candidates.retain(|name| Some(*name) != previous);
        }
        let agent = pick(&candidates)
            .ok_or_else(|| ConclaveError::Orchestrator("no agents available".into()))?;
        debug!(agent = %agent, previous = ?previous, "Random speaker selected");

        let turn = Turn::to(agent);
        Ok(if ctx.iteration() <= 1 {
            turn.with_instruction(ctx.task().to_string())
        } else {
            turn
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::WorkflowInstance;
    use crate::strategy::testing::team;

    #[tokio::test]
    async fn test_never_repeats_previous_speaker() {
        let agents = team(&["Frodo", "Sam", "Pippin"]);
        let mut instance = WorkflowInstance::new("Leave the Shire");
        let strategy = RandomStrategy::new();

        for iteration in 1..=30 {
            instance.iteration = iteration;
            let previous = instance.task_history.last().map(|t| t.agent.clone());
            let mut ctx = TurnContext {
                instance: &mut instance,
                agents: &agents,
            };
            let turn = strategy.next_turn(&mut ctx).await.unwrap();
            assert_ne!(Some(turn.agent.clone()), previous);
            assert_eq!(turn.instruction.is_some(), iteration == 1);
            instance.record_turn(&turn.agent, None, None, "ok");
        }
    }

    #[tokio::test]
    async fn test_single_agent_may_repeat() {
        let agents = team(&["Frodo"]);
        let mut instance = WorkflowInstance::new("Walk");
        instance.record_turn("Frodo", None, None, "step");
        instance.iteration = 2;
        let mut ctx = TurnContext {
            instance: &mut instance,
            agents: &agents,
        };
        let turn = RandomStrategy::new().next_turn(&mut ctx).await.unwrap();
        assert_eq!(turn.agent, "Frodo");
    }
}
