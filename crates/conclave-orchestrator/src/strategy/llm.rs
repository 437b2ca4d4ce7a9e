use super::{SpeakerStrategy, Turn, TurnContext};
use crate::plan::{NextStep, PlanStep, ProgressCheckOutput, TaskPlan, Verdict};
use crate::prompts;
use crate::schemas::{next_step_schema, plan_schema, progress_check_schema};
use async_trait::async_trait;
use conclave_agent::LlmClient;
use conclave_bus::AgentMetadata;
use conclave_core::{BaseMessage, ConclaveError, ConclaveResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Plans are requested as a bare step array; a wrapping `{"plan": [...]}`
/// object is accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Steps(Vec<PlanStep>),
    Wrapped(TaskPlan),
}

impl PlanReply {
    fn into_plan(self) -> TaskPlan {
        match self {
            PlanReply::Steps(steps) => TaskPlan::new(steps),
            PlanReply::Wrapped(plan) => plan,
        }
    }
}

/// Lets a model plan the work, pick each speaker and judge progress.
pub struct LlmStrategy {
    llm: LlmClient,
}

impl LlmStrategy {
    /// Strategy driven by `llm`.
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    fn plan<'a>(ctx: &'a TurnContext<'_>) -> ConclaveResult<&'a TaskPlan> {
        ctx.instance
            .plan
            .as_ref()
            .ok_or_else(|| ConclaveError::Orchestrator("workflow has no plan".into()))
    }
}

fn check_next_step(
    next: &NextStep,
    agents: &BTreeMap<String, AgentMetadata>,
    plan: &TaskPlan,
) -> ConclaveResult<()> {
    if !agents.contains_key(&next.next_agent) {
        return Err(ConclaveError::Orchestrator(format!(
            "unknown agent '{}'",
            next.next_agent
        )));
    }
    if !plan.contains(next.step, next.substep) {
        return Err(ConclaveError::Plan(match next.substep {
            Some(sub) => format!("substep {sub} of step {} is not in the plan", next.step),
            None => format!("step {} is not in the plan", next.step),
        }));
    }
    Ok(())
}

#[async_trait]
impl SpeakerStrategy for LlmStrategy {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn prepare(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Option<BaseMessage>> {
        let prompt = prompts::plan_prompt(ctx.task(), ctx.agents);
        let (reply, response) = self
            .llm
            .chat_structured::<PlanReply>(
                Some(prompts::ORCHESTRATOR_SYSTEM),
                &[BaseMessage::user(prompt)],
                &plan_schema(),
            )
            .await?;
        let plan = reply.into_plan();
        plan.validate()?;
        info!(
            steps = plan.plan.len(),
            tokens = response.tokens_used,
            "Plan generated"
        );

        let announcement = prompts::plan_announcement(ctx.task(), &plan);
        ctx.instance.plan = Some(plan);
        Ok(Some(BaseMessage::user(announcement)))
    }

    async fn next_turn(&self, ctx: &mut TurnContext<'_>) -> ConclaveResult<Turn> {
        let plan = Self::plan(ctx)?;
        let mut conversation = vec![BaseMessage::user(prompts::next_step_prompt(
            ctx.task(),
            ctx.agents,
            plan,
            &ctx.instance.messages,
        ))];

        let mut attempt = 0;
        let next = loop {
            attempt += 1;
            let (next, _) = self
                .llm
                .chat_structured::<NextStep>(
                    Some(prompts::ORCHESTRATOR_SYSTEM),
                    &conversation,
                    &next_step_schema(),
                )
                .await?;
            match check_next_step(&next, ctx.agents, Self::plan(ctx)?) {
                Ok(()) => break next,
                Err(e) if attempt < 2 => {
                    warn!(error = %e, "Invalid next step, asking again");
                    conversation.push(BaseMessage::assistant(serde_json::to_string(&next)?));
                    conversation.push(BaseMessage::user(prompts::next_step_correction(
                        &e.to_string(),
                    )));
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(plan) = ctx.instance.plan.as_mut() {
            plan.mark_in_progress(next.step, next.substep)?;
        }
        debug!(
            agent = %next.next_agent,
            step = next.step,
            substep = ?next.substep,
            "Next step selected"
        );
        Ok(Turn {
            agent: next.next_agent,
            instruction: Some(next.instruction),
            step: Some(next.step),
            substep: next.substep,
        })
    }

    async fn observe(
        &self,
        ctx: &mut TurnContext<'_>,
        _response: &BaseMessage,
    ) -> ConclaveResult<Verdict> {
        let prompt =
            prompts::progress_check_prompt(ctx.task(), Self::plan(ctx)?, &ctx.instance.messages);
        let (check, _) = self
            .llm
            .chat_structured::<ProgressCheckOutput>(
                Some(prompts::ORCHESTRATOR_SYSTEM),
                &[BaseMessage::user(prompt)],
                &progress_check_schema(),
            )
            .await?;

        let Some(plan) = ctx.instance.plan.as_mut() else {
            return Ok(check.verdict);
        };
        if let Some(updates) = &check.plan_status_update {
            if let Err(e) = plan.apply_status_updates(updates) {
                warn!(error = %e, "Rejected plan status updates");
            }
        }
        match (&check.plan_restructure, check.plan_needs_update) {
            (Some(steps), true) => {
                if let Err(e) = plan.apply_restructure(steps) {
                    warn!(error = %e, "Rejected plan restructure");
                } else {
                    info!(steps = steps.len(), "Plan restructured");
                }
            }
            (Some(_), false) => debug!("Ignoring restructure without plan_needs_update"),
            _ => {}
        }
        info!(verdict = %check.verdict, "Progress check");
        Ok(check.verdict)
    }

    async fn finalize(
        &self,
        ctx: &mut TurnContext<'_>,
        verdict: Option<Verdict>,
    ) -> ConclaveResult<String> {
        let verdict = verdict.map_or_else(|| "max_iterations_reached".to_string(), |v| v.to_string());
        let prompt = prompts::summary_prompt(
            ctx.task(),
            ctx.instance.plan.as_ref(),
            &ctx.instance.messages,
            &verdict,
        );
        let response = self
            .llm
            .chat(Some(prompts::ORCHESTRATOR_SYSTEM), &[BaseMessage::user(prompt)])
            .await?;
        Ok(response.content)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plan::StepStatus;
    use crate::state::WorkflowInstance;
    use crate::strategy::testing::team;
    use conclave_agent::ScriptedBackend;

    fn strategy(replies: &[&str]) -> LlmStrategy {
        LlmStrategy::new(LlmClient::from_backend(Box::new(ScriptedBackend::new(
            replies.to_vec(),
        ))))
    }

    const PLAN: &str = r#"[
        {"step": 1, "description": "Scout the pass", "status": "not_started", "substeps": [
            {"substep": 1.1, "description": "Climb", "status": "not_started"}
        ]},
        {"step": 2, "description": "Cross", "status": "not_started", "substeps": null}
    ]"#;

    #[tokio::test]
    async fn test_prepare_stores_plan_and_announces() {
        let agents = team(&["Legolas"]);
        let mut instance = WorkflowInstance::new("Cross the mountains");
        let mut ctx = TurnContext {
            instance: &mut instance,
            agents: &agents,
        };
        let announcement = strategy(&[PLAN]).prepare(&mut ctx).await.unwrap().unwrap();
        assert!(announcement.content.contains("1. [not_started] Scout the pass"));
        assert_eq!(instance.plan.unwrap().plan.len(), 2);
    }

    #[tokio::test]
    async fn test_next_turn_retries_invalid_then_marks_in_progress() {
        let agents = team(&["Legolas", "Gimli"]);
        let mut instance = WorkflowInstance::new("Cross the mountains");
        instance.plan = Some(serde_json::from_str::<PlanReply>(PLAN).unwrap().into_plan());
        let mut ctx = TurnContext {
            instance: &mut instance,
            agents: &agents,
        };
        let s = strategy(&[
            r#"{"next_agent": "Boromir", "instruction": "Go", "step": 1, "substep": null}"#,
            r#"{"next_agent": "Legolas", "instruction": "Climb", "step": 1, "substep": 1.1}"#,
        ]);
        let turn = s.next_turn(&mut ctx).await.unwrap();
        assert_eq!(turn.agent, "Legolas");
        assert_eq!(turn.substep, Some(1.1));

        let plan = instance.plan.unwrap();
        assert_eq!(plan.find_substep(1, 1.1).unwrap().status, StepStatus::InProgress);
        assert_eq!(plan.find_step(1).unwrap().status, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_next_turn_fails_after_second_invalid_pick() {
        let agents = team(&["Legolas"]);
        let mut instance = WorkflowInstance::new("Cross");
        instance.plan = Some(serde_json::from_str::<PlanReply>(PLAN).unwrap().into_plan());
        let mut ctx = TurnContext {
            instance: &mut instance,
            agents: &agents,
        };
        let bad = r#"{"next_agent": "Legolas", "instruction": "Go", "step": 7, "substep": null}"#;
        let err = strategy(&[bad, bad]).next_turn(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ConclaveError::Plan(_)));
    }

    #[tokio::test]
    async fn test_observe_applies_updates_and_gated_restructure() {
        let agents = team(&["Legolas"]);
        let mut instance = WorkflowInstance::new("Cross");
        instance.plan = Some(serde_json::from_str::<PlanReply>(PLAN).unwrap().into_plan());
        let mut ctx = TurnContext {
            instance: &mut instance,
            agents: &agents,
        };
        let s = strategy(&[
            r#"{"verdict": "continue", "plan_needs_update": false,
                "plan_status_update": [{"step": 1, "substep": 1.1, "status": "completed"}],
                "plan_restructure": [{"step": 3, "description": "Ignored", "status": "not_started", "substeps": null}]}"#,
            r#"{"verdict": "completed", "plan_needs_update": true,
                "plan_status_update": [{"step": 2, "substep": null, "status": "completed"}],
                "plan_restructure": [{"step": 3, "description": "Rest", "status": "not_started", "substeps": null}]}"#,
        ]);

        let response = BaseMessage::assistant("Climbed").with_name("Legolas");
        assert_eq!(s.observe(&mut ctx, &response).await.unwrap(), Verdict::Continue);
        {
            let plan = ctx.instance.plan.as_ref().unwrap();
            assert_eq!(plan.find_step(1).unwrap().status, StepStatus::Completed);
            assert_eq!(plan.plan.len(), 2);
        }

        assert_eq!(s.observe(&mut ctx, &response).await.unwrap(), Verdict::Completed);
        let plan = instance.plan.unwrap();
        assert_eq!(plan.plan.len(), 3);
        assert_eq!(plan.find_step(2).unwrap().status, StepStatus::Completed);
    }
}
