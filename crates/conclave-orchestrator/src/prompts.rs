//! Prompt templates for the LLM-driven orchestrator.

use crate::plan::TaskPlan;
use conclave_bus::AgentMetadata;
use conclave_core::BaseMessage;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// System prompt shared by every planning call.
pub const ORCHESTRATOR_SYSTEM: &str = "You are an orchestrator coordinating a team of agents. \
You break tasks into plans, decide who speaks next and judge progress. \
You never do the work yourself.";

/// One line per agent: `- Name: Role. Goal`.
pub fn describe_agents(agents: &BTreeMap<String, AgentMetadata>) -> String {
    let mut out = String::new();
    for meta in agents.values() {
        let _ = write!(out, "- {}: {}", meta.name, meta.role);
        if !meta.goal.is_empty() {
            let _ = write!(out, ". Goal: {}", meta.goal);
        }
        out.push('\n');
    }
    out
}

/// Conversation transcript as `Name: content` lines.
pub fn transcript(messages: &[BaseMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let speaker = m.name.as_deref().unwrap_or("user");
        let _ = writeln!(out, "{speaker}: {}", m.content);
    }
    out
}

/// Asks for a step plan covering `task` with the given team.
pub fn plan_prompt(task: &str, agents: &BTreeMap<String, AgentMetadata>) -> String {
    format!(
        "## Task\n{task}\n\n\
         ## Team\n{}\n\
         Create a step-by-step plan the team can execute to complete the task. \
         Use integer step ids starting at 1. Substeps are optional; their ids \
         are decimals whose integer part is the parent step (2.1, 2.2, ...). \
         Every status starts as \"not_started\". Keep steps concrete and \
         assignable to a single agent from the team.",
        describe_agents(agents)
    )
}

/// The plan as broadcast to the team before work starts.
pub fn plan_announcement(task: &str, plan: &TaskPlan) -> String {
    format!(
        "## Mission Briefing\n\nWe have received the following task:\n\n{task}\n\n\
         ### Execution Plan\n{}",
        plan.render()
    )
}

/// Asks who speaks next and about which step.
pub fn next_step_prompt(
    task: &str,
    agents: &BTreeMap<String, AgentMetadata>,
    plan: &TaskPlan,
    messages: &[BaseMessage],
) -> String {
    format!(
        "## Task\n{task}\n\n\
         ## Team\n{}\n\
         ## Plan\n{}\n\
         ## Conversation so far\n{}\n\
         Select the agent best suited to advance the first unfinished step or \
         substep of the plan and write a direct instruction for them. \
         `next_agent` must be one of the team members listed above, and \
         `step`/`substep` must exist in the plan.",
        describe_agents(agents),
        plan.render(),
        transcript(messages)
    )
}

/// Follow-up asking the model to fix an invalid selection.
pub fn next_step_correction(error: &str) -> String {
    format!("Your selection was rejected: {error}. Choose again using only agents and steps that exist.")
}

/// Asks for a verdict and plan status changes after a turn.
pub fn progress_check_prompt(task: &str, plan: &TaskPlan, messages: &[BaseMessage]) -> String {
    format!(
        "## Task\n{task}\n\n\
         ## Plan\n{}\n\
         ## Conversation so far\n{}\n\
         Assess progress after the latest response.\n\
         - verdict: \"completed\" when the task is fully done, \"failed\" when \
         it cannot be finished, otherwise \"continue\".\n\
         - plan_status_update: status changes for existing steps or substeps.\n\
         - plan_needs_update: true only if the plan itself must change.\n\
         - plan_restructure: at most one step. Reuse an existing step id to \
         replace that step, or use a new id after the last step to add one. \
         Never remove or reopen completed steps or substeps.",
        plan.render(),
        transcript(messages)
    )
}

/// Asks for the final answer once the workflow stops.
pub fn summary_prompt(task: &str, plan: Option<&TaskPlan>, messages: &[BaseMessage], verdict: &str) -> String {
    let plan = plan.map(TaskPlan::render).unwrap_or_default();
    format!(
        "## Task\n{task}\n\n\
         ## Plan\n{plan}\n\
         ## Conversation\n{}\n\
         The workflow ended with verdict \"{verdict}\". Write a concise summary \
         of what the team achieved and what remains open.",
        transcript(messages)
    )
}
