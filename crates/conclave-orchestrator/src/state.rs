use crate::plan::TaskPlan;
use chrono::{DateTime, Utc};
use conclave_bus::{load_json, StateStore, WriteCondition};
use conclave_core::{BaseMessage, ConclaveResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Turns are still being taken.
    Running,
    /// The strategy judged the task done.
    Completed,
    /// The strategy gave up, or a turn could not run.
    Failed,
    /// The turn budget ran out.
    MaxIterationsReached,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::MaxIterationsReached => write!(f, "max_iterations_reached"),
        }
    }
}

/// One agent turn as recorded in the workflow history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Agent that answered.
    pub agent: String,
    /// Plan step the turn targeted.
    #[serde(default)]
    pub step: Option<u32>,
    /// Plan substep the turn targeted.
    #[serde(default)]
    pub substep: Option<f64>,
    /// The answer, or the timeout notice.
    pub result: String,
    /// When the answer was recorded.
    pub timestamp: DateTime<Utc>,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Random UUID.
    pub instance_id: String,
    /// Task the workflow was started with.
    pub input: String,
    /// Final answer, or the error that ended the run.
    #[serde(default)]
    pub output: Option<String>,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: WorkflowStatus,
    /// Turn currently running, 1-based. 0 before the first turn.
    #[serde(default)]
    pub iteration: u32,
    /// Conversation as the orchestrator saw it.
    #[serde(default)]
    pub messages: Vec<BaseMessage>,
    /// Step plan, when the strategy keeps one.
    #[serde(default)]
    pub plan: Option<TaskPlan>,
    /// One entry per answered turn.
    #[serde(default)]
    pub task_history: Vec<TaskResult>,
}

impl WorkflowInstance {
    /// Running instance with a fresh id.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            input: input.into(),
            output: None,
            start_time: Utc::now(),
            end_time: None,
            status: WorkflowStatus::Running,
            iteration: 0,
            messages: Vec::new(),
            plan: None,
            task_history: Vec::new(),
        }
    }

    /// Records an agent's turn in the message log and the task history.
    pub fn record_turn(
        &mut self,
        agent: &str,
        step: Option<u32>,
        substep: Option<f64>,
        result: &str,
    ) {
        self.messages
            .push(BaseMessage::assistant(result).with_name(agent));
        self.task_history.push(TaskResult {
            agent: agent.to_string(),
            step,
            substep,
            result: result.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Stamps the end time along with the final status and output.
    pub fn finish(&mut self, status: WorkflowStatus, output: Option<String>) {
        self.status = status;
        self.output = output;
        self.end_time = Some(Utc::now());
    }
}

/// Every workflow instance an orchestrator has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Instances by id.
    #[serde(default)]
    pub instances: BTreeMap<String, WorkflowInstance>,
}

/// Persists [`WorkflowState`] under one key of a state store.
#[derive(Clone)]
pub struct WorkflowStore {
    store: Arc<dyn StateStore>,
    key: String,
}

impl WorkflowStore {
    /// Workflow map stored at `key` in `store`.
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Every persisted instance. A missing key reads as empty.
    pub async fn load(&self) -> ConclaveResult<WorkflowState> {
        Ok(load_json::<WorkflowState>(self.store.as_ref(), &self.key)
            .await?
            .map(|(state, _)| state)
            .unwrap_or_default())
    }

    /// One persisted instance.
    pub async fn get(&self, instance_id: &str) -> ConclaveResult<Option<WorkflowInstance>> {
        Ok(self.load().await?.instances.remove(instance_id))
    }

    /// Writes `instance` into the shared state, retrying on concurrent writes
    /// from other orchestrators.
    pub async fn save_instance(&self, instance: &WorkflowInstance) -> ConclaveResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (mut state, etag) = load_json::<WorkflowState>(self.store.as_ref(), &self.key)
                .await?
                .map_or((WorkflowState::default(), None), |(s, e)| (s, Some(e)));
            state
                .instances
                .insert(instance.instance_id.clone(), instance.clone());
            let value = serde_json::to_value(&state)?;
            let condition = match &etag {
                Some(etag) => WriteCondition::Etag(etag),
                None => WriteCondition::Missing,
            };
            match self.store.save(&self.key, value, condition).await {
                Ok(_) => {
                    debug!(
                        instance = %instance.instance_id,
                        iteration = instance.iteration,
                        "Workflow state saved"
                    );
                    return Ok(());
                }
                Err(e) if e.is_etag_mismatch() && attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(attempt, key = %self.key, "Workflow state changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_bus::InMemoryStateStore;

    #[tokio::test]
    async fn test_instances_accumulate() {
        let store = WorkflowStore::new(
            Arc::new(InMemoryStateStore::new("agenticworkflowstate")),
            "workflow_state",
        );
        let mut first = WorkflowInstance::new("Destroy the ring");
        let second = WorkflowInstance::new("Defend Helm's Deep");
        store.save_instance(&first).await.unwrap();
        store.save_instance(&second).await.unwrap();

        first.record_turn("Frodo", Some(1), None, "I will take it");
        first.finish(WorkflowStatus::Completed, Some("done".into()));
        store.save_instance(&first).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.instances.len(), 2);
        let saved = store.get(&first.instance_id).await.unwrap().unwrap();
        assert_eq!(saved.status, WorkflowStatus::Completed);
        assert_eq!(saved.task_history[0].agent, "Frodo");
        assert_eq!(saved.messages[0].name.as_deref(), Some("Frodo"));
        assert!(saved.end_time.is_some());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(WorkflowStatus::MaxIterationsReached).unwrap(),
            "max_iterations_reached"
        );
    }
}
