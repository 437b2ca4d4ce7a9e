use conclave_core::{ConclaveError, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Substep ids are decimal labels such as `2.1`; two ids closer than this are equal.
const SUBSTEP_EPSILON: f64 = 1e-6;

/// Whether two substep ids denote the same substep.
pub fn same_substep(a: f64, b: f64) -> bool {
    (a - b).abs() < SUBSTEP_EPSILON
}

/// Progress of a step or substep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not picked up yet.
    #[default]
    NotStarted,
    /// Partly done.
    InProgress,
    /// Cannot go on.
    Blocked,
    /// Done.
    Completed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::NotStarted => write!(f, "not_started"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Blocked => write!(f, "blocked"),
            StepStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A unit of work inside a [`PlanStep`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStep {
    /// Decimal id whose integer part is the parent step, e.g. `2.1`.
    pub substep: f64,
    /// What to do.
    pub description: String,
    /// Progress; `not_started` when absent.
    #[serde(default)]
    pub status: StepStatus,
}

/// One top-level step of a [`TaskPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step id, unique within the plan.
    pub step: u32,
    /// What to do.
    pub description: String,
    /// Progress. Derived from the substeps whenever they change.
    #[serde(default)]
    pub status: StepStatus,
    /// Finer-grained work, if any.
    #[serde(default)]
    pub substeps: Option<Vec<SubStep>>,
}

impl PlanStep {
    /// A not-started step without substeps.
    pub fn new(step: u32, description: impl Into<String>) -> Self {
        Self {
            step,
            description: description.into(),
            status: StepStatus::NotStarted,
            substeps: None,
        }
    }

    /// Appends a not-started substep.
    pub fn with_substep(mut self, substep: f64, description: impl Into<String>) -> Self {
        self.substeps.get_or_insert_with(Vec::new).push(SubStep {
            substep,
            description: description.into(),
            status: StepStatus::NotStarted,
        });
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    fn substeps(&self) -> &[SubStep] {
        self.substeps.as_deref().unwrap_or(&[])
    }

    fn find_substep(&self, id: f64) -> Option<&SubStep> {
        self.substeps().iter().find(|s| same_substep(s.substep, id))
    }

    fn find_substep_mut(&mut self, id: f64) -> Option<&mut SubStep> {
        self.substeps
            .as_mut()
            .and_then(|subs| subs.iter_mut().find(|s| same_substep(s.substep, id)))
    }

    /// Recomputes the status from the substeps. Steps without substeps keep theirs.
    fn derive_status(&mut self) {
        let subs = self.substeps();
        if subs.is_empty() {
            return;
        }
        let has = |status: StepStatus| subs.iter().any(|s| s.status == status);
        let derived = if subs.iter().all(|s| s.status == StepStatus::Completed) {
            Some(StepStatus::Completed)
        } else if has(StepStatus::InProgress) {
            Some(StepStatus::InProgress)
        } else if has(StepStatus::Blocked) {
            Some(StepStatus::Blocked)
        } else if has(StepStatus::Completed) {
            Some(StepStatus::InProgress)
        } else {
            None
        };
        if let Some(status) = derived {
            self.status = status;
        }
    }

    fn validate(&self) -> ConclaveResult<()> {
        let mut seen: Vec<f64> = Vec::new();
        for sub in self.substeps() {
            if !sub.substep.is_finite()
                || sub.substep.floor() != f64::from(self.step)
                || same_substep(sub.substep, f64::from(self.step))
            {
                return Err(ConclaveError::Plan(format!(
                    "substep {} does not belong to step {}",
                    sub.substep, self.step
                )));
            }
            if seen.iter().any(|s| same_substep(*s, sub.substep)) {
                return Err(ConclaveError::Plan(format!(
                    "duplicate substep {} in step {}",
                    sub.substep, self.step
                )));
            }
            seen.push(sub.substep);
        }
        Ok(())
    }
}

/// Ordered execution plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Steps in execution order.
    pub plan: Vec<PlanStep>,
}

/// Reference to a step, or to one of its substeps.
pub type StepRef = (u32, Option<f64>);

/// The orchestrator's pick for the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextStep {
    /// Agent to trigger.
    pub next_agent: String,
    /// What that agent should do now.
    pub instruction: String,
    /// Plan step the turn works on.
    pub step: u32,
    /// Substep of `step`, when the turn targets one.
    #[serde(default)]
    pub substep: Option<f64>,
}

/// Status change for one step or substep, reported by a progress check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusUpdate {
    /// Step id.
    pub step: u32,
    /// Substep id; `None` targets the step itself.
    #[serde(default)]
    pub substep: Option<f64>,
    /// New status.
    pub status: StepStatus,
}

/// Whether a workflow should go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Take another turn.
    Continue,
    /// The task is done.
    Completed,
    /// The task cannot be done.
    Failed,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Continue => write!(f, "continue"),
            Verdict::Completed => write!(f, "completed"),
            Verdict::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a progress check after an agent's turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCheckOutput {
    /// Whether to continue.
    pub verdict: Verdict,
    /// Gate for `plan_restructure`.
    pub plan_needs_update: bool,
    /// Status changes to apply, all or nothing.
    #[serde(default)]
    pub plan_status_update: Option<Vec<PlanStatusUpdate>>,
    /// At most one restructured step.
    #[serde(default)]
    pub plan_restructure: Option<Vec<PlanStep>>,
}

fn describe(step: u32, substep: Option<f64>) -> String {
    match substep {
        Some(sub) => format!("substep {sub} of step {step}"),
        None => format!("step {step}"),
    }
}

impl TaskPlan {
    /// Plan over `plan`.
    pub fn new(plan: Vec<PlanStep>) -> Self {
        Self { plan }
    }

    /// Checks id uniqueness and substep ownership.
    pub fn validate(&self) -> ConclaveResult<()> {
        if self.plan.is_empty() {
            return Err(ConclaveError::Plan("plan has no steps".into()));
        }
        let mut ids = HashSet::new();
        for step in &self.plan {
            if !ids.insert(step.step) {
                return Err(ConclaveError::Plan(format!("duplicate step {}", step.step)));
            }
            step.validate()?;
        }
        Ok(())
    }

    /// Step by id.
    pub fn find_step(&self, step: u32) -> Option<&PlanStep> {
        self.plan.iter().find(|s| s.step == step)
    }

    fn find_step_mut(&mut self, step: u32) -> Option<&mut PlanStep> {
        self.plan.iter_mut().find(|s| s.step == step)
    }

    /// Substep `substep` of step `step`.
    pub fn find_substep(&self, step: u32, substep: f64) -> Option<&SubStep> {
        self.find_step(step).and_then(|s| s.find_substep(substep))
    }

    /// Whether `step` (and `substep`, if given) exist in the plan.
    pub fn contains(&self, step: u32, substep: Option<f64>) -> bool {
        match substep {
            Some(sub) => self.find_substep(step, sub).is_some(),
            None => self.find_step(step).is_some(),
        }
    }

    /// Applies a batch of status updates. If any update names an unknown
    /// id, nothing is applied. Parents of updated substeps are re-derived.
    pub fn apply_status_updates(&mut self, updates: &[PlanStatusUpdate]) -> ConclaveResult<()> {
        if let Some(bad) = updates.iter().find(|u| !self.contains(u.step, u.substep)) {
            return Err(ConclaveError::Plan(format!(
                "status update for unknown {}",
                describe(bad.step, bad.substep)
            )));
        }

        let mut touched_parents = HashSet::new();
        for update in updates {
            let Some(step) = self.find_step_mut(update.step) else {
                continue;
            };
            match update.substep {
                Some(id) => {
                    if let Some(sub) = step.find_substep_mut(id) {
                        sub.status = update.status;
                        touched_parents.insert(update.step);
                    }
                }
                None => step.status = update.status,
            }
        }
        for id in touched_parents {
            if let Some(step) = self.find_step_mut(id) {
                step.derive_status();
            }
        }
        Ok(())
    }

    /// Replaces one step, or appends one after every existing step.
    ///
    /// A replacement must keep every completed id of the step it replaces,
    /// still completed.
    pub fn apply_restructure(&mut self, steps: &[PlanStep]) -> ConclaveResult<()> {
        let new = match steps {
            [] => return Ok(()),
            [one] => one,
            _ => {
                return Err(ConclaveError::Plan(format!(
                    "restructure may modify one step at a time, got {}",
                    steps.len()
                )))
            }
        };
        new.validate()?;

        let mut new = new.clone();
        new.derive_status();

        match self.find_step(new.step) {
            Some(old) => {
                if old.status == StepStatus::Completed && new.status != StepStatus::Completed {
                    return Err(ConclaveError::Plan(format!(
                        "restructure would reopen completed step {}",
                        old.step
                    )));
                }
                for done in old
                    .substeps()
                    .iter()
                    .filter(|s| s.status == StepStatus::Completed)
                {
                    let kept = new
                        .find_substep(done.substep)
                        .is_some_and(|s| s.status == StepStatus::Completed);
                    if !kept {
                        return Err(ConclaveError::Plan(format!(
                            "restructure would drop or reopen completed substep {}",
                            done.substep
                        )));
                    }
                }
                if let Some(slot) = self.find_step_mut(new.step) {
                    *slot = new;
                }
            }
            None => {
                let max = self.plan.iter().map(|s| s.step).max().unwrap_or(0);
                if new.step <= max {
                    return Err(ConclaveError::Plan(format!(
                        "new step {} must come after step {max}",
                        new.step
                    )));
                }
                self.plan.push(new);
            }
        }
        Ok(())
    }

    /// Marks the targeted step or substep in progress. Completed targets are left alone.
    pub fn mark_in_progress(&mut self, step: u32, substep: Option<f64>) -> ConclaveResult<()> {
        let already_done = match substep {
            Some(sub) => self
                .find_substep(step, sub)
                .map(|s| s.status == StepStatus::Completed),
            None => self.find_step(step).map(|s| s.status == StepStatus::Completed),
        };
        match already_done {
            None => Err(ConclaveError::Plan(format!(
                "cannot start unknown {}",
                describe(step, substep)
            ))),
            Some(true) => Ok(()),
            Some(false) => self.apply_status_updates(&[PlanStatusUpdate {
                step,
                substep,
                status: StepStatus::InProgress,
            }]),
        }
    }

    /// Whether every step is completed.
    pub fn is_complete(&self) -> bool {
        !self.plan.is_empty() && self.plan.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// First step (and its first open substep) not yet completed.
    pub fn next_pending(&self) -> Option<StepRef> {
        let step = self.plan.iter().find(|s| s.status != StepStatus::Completed)?;
        let sub = step
            .substeps()
            .iter()
            .find(|s| s.status != StepStatus::Completed)
            .map(|s| s.substep);
        Some((step.step, sub))
    }

    /// Every completed step and substep.
    pub fn completed_ids(&self) -> Vec<StepRef> {
        let mut ids = Vec::new();
        for step in &self.plan {
            if step.status == StepStatus::Completed {
                ids.push((step.step, None));
            }
            for sub in step.substeps() {
                if sub.status == StepStatus::Completed {
                    ids.push((step.step, Some(sub.substep)));
                }
            }
        }
        ids
    }

    /// Plain-text outline used in prompts and logs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for step in &self.plan {
            let _ = writeln!(out, "{}. [{}] {}", step.step, step.status, step.description);
            for sub in step.substeps() {
                let _ = writeln!(out, "   {} [{}] {}", sub.substep, sub.status, sub.description);
            }
        }
        out
    }
}
