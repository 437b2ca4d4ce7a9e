#![allow(clippy::unwrap_used, clippy::expect_used)]

use conclave_agent::{Agent, AgentConfig, LlmClient, ScriptedBackend};
use conclave_bus::{
    AgentMetadata, AgentRegistry, HttpMessageBus, InMemoryMessageBus, InMemoryStateStore,
    MessageBus,
};
use conclave_core::ConclaveError;
use conclave_orchestrator::{
    timeout_message, LlmStrategy, Orchestrator, OrchestratorConfig, RandomStrategy,
    RoundRobinStrategy, SpeakerStrategy, StepStatus, WorkflowStatus, WorkflowStore,
};
use conclave_service::{AgentService, ServiceConfig, ServiceHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn wizard(name: &str) -> AgentMetadata {
    AgentMetadata {
        name: name.into(),
        role: "Wizard".into(),
        goal: String::new(),
        topic_name: name.into(),
        pubsub_name: "messagepubsub".into(),
        orchestrator: false,
    }
}

struct Fellowship {
    bus: Arc<dyn MessageBus>,
    registry: AgentRegistry,
    workflows: WorkflowStore,
    handles: Vec<ServiceHandle>,
}

impl Fellowship {
    fn new() -> Self {
        Self::on(Arc::new(InMemoryMessageBus::new("messagepubsub", 64)))
    }

    fn on(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            registry: AgentRegistry::new(
                Arc::new(InMemoryStateStore::new("agentsregistrystore")),
                "agents_registry",
            ),
            workflows: WorkflowStore::new(
                Arc::new(InMemoryStateStore::new("agenticworkflowstate")),
                "workflow_state",
            ),
            handles: Vec::new(),
        }
    }

    /// Starts an agent that answers every turn with `"<name> reporting (<n> messages)"`.
    async fn join(&mut self, name: &'static str) {
        let backend = ScriptedBackend::responder(move |_, messages| {
            Ok(format!("{name} reporting ({} messages)", messages.len()))
        });
        let service = Arc::new(AgentService::new(
            Arc::new(Agent::new(
                AgentConfig::new(name).with_role("Hobbit"),
                LlmClient::from_backend(Box::new(backend)),
            )),
            self.bus.clone(),
            self.registry.clone(),
            ServiceConfig::default(),
        ));
        self.handles.push(service.start().await.unwrap());
    }

    fn orchestrator<S: SpeakerStrategy>(&self, strategy: S, max_iterations: u32) -> Orchestrator<S> {
        Orchestrator::new(
            OrchestratorConfig {
                max_iterations,
                response_timeout: Duration::from_secs(5),
                ..OrchestratorConfig::default()
            },
            strategy,
            self.bus.clone(),
            self.registry.clone(),
            self.workflows.clone(),
        )
    }

    async fn disband(self) {
        for handle in self.handles {
            handle.stop().await.unwrap();
        }
    }
}

#[tokio::test]
async fn round_robin_rotates_and_shares_context() {
    let mut team = Fellowship::new();
    team.join("Frodo").await;
    team.join("Sam").await;

    let orchestrator = team.orchestrator(RoundRobinStrategy::new(), 3);
    orchestrator.register().await.unwrap();
    let outcome = orchestrator.run("Take the ring to Mordor").await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::MaxIterationsReached);
    assert_eq!(outcome.iterations, 3);
    assert!(outcome.output.starts_with("Frodo reporting"));

    let instance = team.workflows.get(&outcome.instance_id).await.unwrap().unwrap();
    let speakers: Vec<_> = instance.task_history.iter().map(|t| t.agent.as_str()).collect();
    assert_eq!(speakers, ["Frodo", "Sam", "Frodo"]);
    assert_eq!(instance.status, WorkflowStatus::MaxIterationsReached);
    assert_eq!(instance.output.as_deref(), Some(outcome.output.as_str()));
    assert!(instance.end_time.is_some());

    // Sam saw the task and Frodo's answer before speaking
    let sam = &team.handles[1].service().get_messages();
    assert!(sam.iter().any(|m| m.content == "Take the ring to Mordor"));
    assert!(sam
        .iter()
        .any(|m| m.name.as_deref() == Some("Frodo") && m.content.starts_with("Frodo reporting")));

    let metrics = orchestrator.monitor().aggregate_metrics().await;
    assert_eq!(metrics.total_turns, 3);
    assert_eq!(metrics.timeouts, 0);

    orchestrator.deregister().await.unwrap();
    team.disband().await;
}

#[tokio::test]
async fn random_never_repeats_the_previous_speaker() {
    let mut team = Fellowship::new();
    team.join("Merry").await;
    team.join("Pippin").await;

    let orchestrator = team.orchestrator(RandomStrategy::new(), 4);
    let outcome = orchestrator.run("Distract the Uruk-hai").await.unwrap();
    let instance = team.workflows.get(&outcome.instance_id).await.unwrap().unwrap();

    assert_eq!(instance.task_history.len(), 4);
    for pair in instance.task_history.windows(2) {
        assert_ne!(pair[0].agent, pair[1].agent);
    }
    team.disband().await;
}

#[tokio::test]
async fn llm_strategy_plans_and_completes() {
    let mut team = Fellowship::new();
    team.join("Frodo").await;
    team.join("Sam").await;

    let planner = ScriptedBackend::new([
        r#"[{"step": 1, "description": "Cross the Dead Marshes", "status": "not_started",
             "substeps": [{"substep": 1.1, "description": "Follow Gollum", "status": "not_started"}]},
            {"step": 2, "description": "Climb Mount Doom", "status": "not_started", "substeps": null}]"#,
        r#"{"next_agent": "Sam", "instruction": "Follow Gollum through the marshes", "step": 1, "substep": 1.1}"#,
        r#"{"verdict": "completed", "plan_needs_update": false,
            "plan_status_update": [{"step": 1, "substep": 1.1, "status": "completed"},
                                   {"step": 2, "substep": null, "status": "completed"}],
            "plan_restructure": null}"#,
        "The ring was destroyed.",
    ]);
    let orchestrator = team.orchestrator(LlmStrategy::new(LlmClient::from_backend(Box::new(planner))), 5);
    let outcome = orchestrator.run("Destroy the ring").await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.output, "The ring was destroyed.");
    let plan = outcome.plan.unwrap();
    assert!(plan.is_complete());
    assert_eq!(plan.find_step(1).unwrap().status, StepStatus::Completed);

    let instance = team.workflows.get(&outcome.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.task_history[0].agent, "Sam");
    assert_eq!(instance.task_history[0].substep, Some(1.1));

    // Both agents received the plan briefing
    let frodo = team.handles[0].service().get_messages();
    assert!(frodo.iter().any(|m| m.content.contains("Execution Plan")));
    team.disband().await;
}

#[tokio::test]
async fn silent_agent_times_out_and_workflow_continues() {
    let team = Fellowship::new();
    team.registry.register(wizard("Saruman")).await.unwrap();

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            max_iterations: 2,
            response_timeout: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        },
        RoundRobinStrategy::new(),
        team.bus.clone(),
        team.registry.clone(),
        team.workflows.clone(),
    );
    let outcome = orchestrator.run("Open the gates of Isengard").await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::MaxIterationsReached);
    assert_eq!(outcome.output, timeout_message("Saruman"));
    let state = orchestrator.monitor().get_state("Saruman").await.unwrap();
    assert_eq!(state.metrics.timeouts, 2);
}

#[tokio::test]
async fn empty_registry_fails_the_workflow() {
    let team = Fellowship::new();
    let orchestrator = team.orchestrator(RoundRobinStrategy::new(), 3);
    orchestrator.register().await.unwrap();

    let err = orchestrator.run("Anyone there?").await.unwrap_err();
    assert!(matches!(err, ConclaveError::Orchestrator(ref m) if m.contains("no agents")));

    let state = team.workflows.load().await.unwrap();
    let instance = state.instances.values().next().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn llm_failed_verdict_ends_the_workflow() {
    let mut team = Fellowship::new();
    team.join("Boromir").await;

    let planner = ScriptedBackend::new([
        r#"[{"step": 1, "description": "Guard the ring bearer", "status": "not_started", "substeps": null}]"#,
        r#"{"next_agent": "Boromir", "instruction": "Keep Frodo safe", "step": 1, "substep": null}"#,
        r#"{"verdict": "failed", "plan_needs_update": false,
            "plan_status_update": [{"step": 1, "substep": null, "status": "blocked"}],
            "plan_restructure": null}"#,
        "The fellowship is broken.",
    ]);
    let orchestrator = team.orchestrator(LlmStrategy::new(LlmClient::from_backend(Box::new(planner))), 5);
    let outcome = orchestrator.run("Reach Minas Tirith").await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.output, "The fellowship is broken.");
    assert_eq!(
        outcome.plan.unwrap().find_step(1).unwrap().status,
        StepStatus::Blocked
    );

    let instance = team.workflows.get(&outcome.instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.output.as_deref(), Some("The fellowship is broken."));
    assert_eq!(instance.task_history.len(), 1);
    assert!(instance.end_time.is_some());
    team.disband().await;
}

#[tokio::test]
async fn undeliverable_trigger_counts_as_agent_error() {
    let team = Fellowship::new();
    team.registry.register(wizard("Radagast")).await.unwrap();
    let local = Arc::new(InMemoryMessageBus::new("messagepubsub", 16));
    let bus: Arc<dyn MessageBus> = Arc::new(HttpMessageBus::new(
        local,
        HashMap::from([("Radagast".to_string(), "http://127.0.0.1:1".to_string())]),
    ));

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        RoundRobinStrategy::new(),
        bus,
        team.registry.clone(),
        team.workflows.clone(),
    );
    let err = orchestrator.run("Fetch the eagles").await.unwrap_err();
    assert!(matches!(err, ConclaveError::Http(_)));

    let state = orchestrator.monitor().get_state("Radagast").await.unwrap();
    assert_eq!(state.metrics.errors, 1);
    assert_eq!(orchestrator.monitor().aggregate_metrics().await.errors, 1);
    let persisted = team.workflows.load().await.unwrap();
    assert_eq!(
        persisted.instances.values().next().unwrap().status,
        WorkflowStatus::Failed
    );
}

#[tokio::test]
async fn broadcast_failure_does_not_stop_the_workflow() {
    let local = Arc::new(InMemoryMessageBus::new("messagepubsub", 64));
    let mut team = Fellowship::on(Arc::new(HttpMessageBus::new(
        local,
        HashMap::from([("beacon_channel".to_string(), "http://127.0.0.1:1".to_string())]),
    )));
    team.join("Frodo").await;

    let orchestrator = team.orchestrator(RoundRobinStrategy::new(), 2);
    let outcome = orchestrator.run("Leave Bag End").await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::MaxIterationsReached);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.output.starts_with("Frodo reporting"));
    assert_eq!(orchestrator.monitor().aggregate_metrics().await.errors, 0);
    team.disband().await;
}
