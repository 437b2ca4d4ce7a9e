use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters kept per agent, and summed across agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Turns answered in time.
    pub total_turns: u32,
    /// Turns that ran past the response timeout.
    pub timeouts: u32,
    /// Triggers that could not be delivered or awaited.
    pub errors: u32,
    /// Time spent waiting for answers, in milliseconds.
    pub duration_ms: u64,
}

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Waiting for a trigger.
    Idle,
    /// Triggered, answer pending.
    Working,
    /// Last turn timed out or could not be dispatched.
    Error,
}

/// Live view of one agent, as seen by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent name.
    pub name: String,
    /// Workflow instance the agent is currently working for.
    pub current_instance: Option<String>,
    /// Current activity.
    pub status: WorkerStatus,
    /// Counters since the monitor was created.
    pub metrics: AgentMetrics,
}

impl AgentState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current_instance: None,
            status: WorkerStatus::Idle,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks what every dispatched agent is doing and how it has performed.
/// Agents appear the first time they are dispatched to.
#[derive(Clone, Default)]
pub struct AgentMonitor {
    states: Arc<RwLock<BTreeMap<String, AgentState>>>,
}

impl AgentMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an agent as working for a workflow instance.
    pub async fn start_task(&self, agent: &str, instance_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| AgentState::new(agent));
        state.current_instance = Some(instance_id.to_string());
        state.status = WorkerStatus::Working;
    }

    /// Mark an agent as idle after a turn, counting the turn.
    pub async fn finish_task(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.current_instance = None;
            state.status = WorkerStatus::Idle;
            state.metrics.total_turns += 1;
        }
    }

    /// Record an agent that did not answer in time.
    pub async fn record_timeout(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.current_instance = None;
            state.metrics.timeouts += 1;
            state.status = WorkerStatus::Error;
        }
    }

    /// Record a trigger that failed to go out or whose answer could not be awaited.
    pub async fn record_error(&self, agent: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.metrics.errors += 1;
            state.status = WorkerStatus::Error;
        }
    }

    /// Record how long an agent took to answer.
    pub async fn record_duration(&self, agent: &str, duration_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent) {
            state.metrics.duration_ms += duration_ms;
        }
    }

    /// Every tracked agent, by name.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        self.states.read().await.values().cloned().collect()
    }

    /// One agent, if it was ever dispatched to.
    pub async fn get_state(&self, agent: &str) -> Option<AgentState> {
        self.states.read().await.get(agent).cloned()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.total_turns += state.metrics.total_turns;
            total.timeouts += state.metrics.timeouts;
            total.errors += state.metrics.errors;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// `{"agents": [...], "aggregate": {...}}` view for logs.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}
