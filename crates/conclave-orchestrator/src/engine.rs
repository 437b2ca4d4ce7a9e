use crate::monitor::AgentMonitor;
use crate::plan::{TaskPlan, Verdict};
use crate::state::{WorkflowInstance, WorkflowStatus, WorkflowStore};
use crate::strategy::{SpeakerStrategy, TurnContext};
use conclave_bus::{AgentMetadata, AgentRegistry, Delivery, MessageBus, RouteRule, Subscription};
use conclave_core::{AgentTaskResponse, BaseMessage, ConclaveError, ConclaveResult, TriggerAction};
use conclave_service::{Messenger, DEFAULT_BROADCAST_TOPIC, DEFAULT_TASK_RESULTS_TOPIC, WORKFLOW_INSTANCE_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Route task results are delivered under.
pub const TASK_RESULT_ROUTE: &str = "/TaskResult";

/// Settings of one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Registry name, and the `name` on messages the orchestrator sends.
    pub name: String,
    /// Turn budget of a workflow.
    pub max_iterations: u32,
    /// How long to wait for an agent's answer before recording a timeout.
    pub response_timeout: Duration,
    /// Topic every agent listens on for shared context.
    pub broadcast_topic: String,
    /// Topic agents answer triggers on.
    pub task_results_topic: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "Orchestrator".to_string(),
            max_iterations: 3,
            response_timeout: Duration::from_secs(300),
            broadcast_topic: DEFAULT_BROADCAST_TOPIC.to_string(),
            task_results_topic: DEFAULT_TASK_RESULTS_TOPIC.to_string(),
        }
    }
}

/// Result of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    /// Id of the persisted [`WorkflowInstance`].
    pub instance_id: String,
    /// How the workflow ended.
    pub status: WorkflowStatus,
    /// Final answer produced by the strategy.
    pub output: String,
    /// Turns taken.
    pub iterations: u32,
    /// Plan as it stood at the end (LLM strategy only).
    #[serde(default)]
    pub plan: Option<TaskPlan>,
}

/// Text recorded when an agent does not answer within the response timeout.
pub fn timeout_message(agent: &str) -> String {
    format!("Timeout occurred. {agent} did not respond on time. We need to try again...")
}

/// Drives a team of agents through a task: picks a speaker with the
/// strategy, triggers it over the bus, waits for its result and shares it
/// with everyone, until the strategy reaches a verdict or the iteration
/// budget runs out.
pub struct Orchestrator<S> {
    config: OrchestratorConfig,
    strategy: S,
    messenger: Messenger,
    workflows: WorkflowStore,
    monitor: AgentMonitor,
    results: Mutex<mpsc::Receiver<Delivery>>,
}

impl<S: SpeakerStrategy> Orchestrator<S> {
    /// Creates the orchestrator and subscribes it to task results.
    pub fn new(
        config: OrchestratorConfig,
        strategy: S,
        bus: Arc<dyn MessageBus>,
        registry: AgentRegistry,
        workflows: WorkflowStore,
    ) -> Self {
        let mut subscription = Subscription::new(bus.name(), config.task_results_topic.clone());
        subscription.add_rule(RouteRule::for_message::<AgentTaskResponse>(TASK_RESULT_ROUTE));
        let results = bus.subscribe(subscription);

        let messenger = Messenger::new(
            config.name.clone(),
            bus,
            registry,
            config.broadcast_topic.clone(),
            config.task_results_topic.clone(),
        );
        Self {
            config,
            strategy,
            messenger,
            workflows,
            monitor: AgentMonitor::new(),
            results: Mutex::new(results),
        }
    }

    /// Settings this orchestrator runs with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Per-agent activity and metrics.
    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    /// Where workflow instances are persisted.
    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    /// Advertises the orchestrator in the registry. Agents never see it as a peer.
    pub async fn register(&self) -> ConclaveResult<()> {
        self.messenger
            .registry()
            .register(AgentMetadata {
                name: self.config.name.clone(),
                role: "Orchestrator".to_string(),
                goal: format!("Coordinate the team ({} strategy)", self.strategy.name()),
                topic_name: self.config.name.clone(),
                pubsub_name: self.messenger.bus().name().to_string(),
                orchestrator: true,
            })
            .await
    }

    /// Removes the orchestrator's registry entry.
    pub async fn deregister(&self) -> ConclaveResult<()> {
        self.messenger.registry().deregister(&self.config.name).await
    }

    /// Runs `task` to completion. Runs on one orchestrator are serialized.
    pub async fn run(&self, task: &str) -> ConclaveResult<WorkflowOutcome> {
        let mut results = self.results.lock().await;
        // Answers to an earlier, abandoned run
        while results.try_recv().is_ok() {}

        let mut instance = WorkflowInstance::new(task);
        let opening = BaseMessage::user(task).with_name(&self.config.name);
        instance.messages.push(opening.clone());
        self.workflows.save_instance(&instance).await?;
        info!(
            instance = %instance.instance_id,
            strategy = self.strategy.name(),
            max_iterations = self.config.max_iterations,
            "Workflow started"
        );

        let agents = self
            .messenger
            .registry()
            .agents_excluding(&self.config.name)
            .await;
        if agents.is_empty() {
            let err = ConclaveError::Orchestrator("no agents available".into());
            self.fail(&mut instance, &err).await;
            return Err(err);
        }

        let driven = async {
            self.share(&opening).await;
            self.drive(&mut instance, &agents, &mut results).await
        }
        .await;

        match driven {
            Ok((status, output)) => {
                instance.finish(status, Some(output.clone()));
                self.workflows.save_instance(&instance).await?;
                info!(
                    instance = %instance.instance_id,
                    status = %status,
                    iterations = instance.iteration,
                    "Workflow finished"
                );
                Ok(WorkflowOutcome {
                    instance_id: instance.instance_id,
                    status,
                    output,
                    iterations: instance.iteration,
                    plan: instance.plan,
                })
            }
            Err(e) => {
                self.fail(&mut instance, &e).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, instance: &mut WorkflowInstance, err: &ConclaveError) {
        error!(instance = %instance.instance_id, error = %err, "Workflow failed");
        instance.finish(WorkflowStatus::Failed, Some(err.to_string()));
        if let Err(e) = self.workflows.save_instance(instance).await {
            error!(instance = %instance.instance_id, error = %e, "Failed to persist failed workflow");
        }
    }

    async fn drive(
        &self,
        instance: &mut WorkflowInstance,
        agents: &BTreeMap<String, AgentMetadata>,
        results: &mut mpsc::Receiver<Delivery>,
    ) -> ConclaveResult<(WorkflowStatus, String)> {
        let instance_id = instance.instance_id.clone();
        let mut ctx = TurnContext { instance, agents };

        if let Some(message) = self.strategy.prepare(&mut ctx).await? {
            let message = message.with_name(&self.config.name);
            ctx.instance.messages.push(message.clone());
            self.share(&message).await;
            self.workflows.save_instance(ctx.instance).await?;
        }

        let mut verdict = None;
        for iteration in 1..=self.config.max_iterations {
            ctx.instance.iteration = iteration;
            let turn = self.strategy.next_turn(&mut ctx).await?;
            let target = agents.get(&turn.agent).ok_or_else(|| {
                ConclaveError::Orchestrator(format!("unknown agent '{}'", turn.agent))
            })?;
            if let Some(instruction) = &turn.instruction {
                ctx.instance
                    .messages
                    .push(BaseMessage::user(instruction.clone()).with_name(&self.config.name));
            }

            let trigger = TriggerAction {
                task: turn.instruction.clone(),
                iteration,
                workflow_instance_id: Some(instance_id.clone()),
            };
            info!(
                instance = %instance_id,
                iteration,
                agent = %turn.agent,
                "Triggering agent"
            );
            self.monitor.start_task(&turn.agent, &instance_id).await;
            let started = Instant::now();
            let published = self
                .messenger
                .publish(
                    &target.pubsub_name,
                    &target.topic_name,
                    &trigger,
                    &[(WORKFLOW_INSTANCE_KEY, instance_id.as_str())],
                )
                .await;
            if let Err(e) = published {
                self.monitor.record_error(&turn.agent).await;
                return Err(e);
            }

            let answer = match self.await_response(results, &turn.agent, &instance_id).await {
                Ok(answer) => answer,
                Err(e) => {
                    self.monitor.record_error(&turn.agent).await;
                    return Err(e);
                }
            };
            let content = match answer {
                Some(content) => {
                    self.monitor.finish_task(&turn.agent).await;
                    content
                }
                None => {
                    warn!(agent = %turn.agent, iteration, "Agent did not respond on time");
                    self.monitor.record_timeout(&turn.agent).await;
                    timeout_message(&turn.agent)
                }
            };
            self.monitor
                .record_duration(
                    &turn.agent,
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                )
                .await;

            ctx.instance
                .record_turn(&turn.agent, turn.step, turn.substep, &content);
            let response = BaseMessage::assistant(content).with_name(&turn.agent);
            self.share(&response).await;
            self.workflows.save_instance(ctx.instance).await?;

            let judged = self.strategy.observe(&mut ctx, &response).await?;
            self.workflows.save_instance(ctx.instance).await?;
            if judged != Verdict::Continue {
                verdict = Some(judged);
                break;
            }
        }

        let status = match verdict {
            Some(Verdict::Completed) => WorkflowStatus::Completed,
            Some(Verdict::Failed) => WorkflowStatus::Failed,
            _ => WorkflowStatus::MaxIterationsReached,
        };
        let output = self.strategy.finalize(&mut ctx, verdict).await?;
        Ok((status, output))
    }

    /// Broadcasts `message` to the team. Agents that miss it still get the
    /// next trigger, so a failed broadcast only costs them context.
    async fn share(&self, message: &BaseMessage) {
        if let Err(e) = self.messenger.broadcast_message(message).await {
            warn!(error = %e, "Broadcast did not reach every agent");
        }
    }

    /// Waits for `agent`'s answer to this instance. `None` on timeout.
    async fn await_response(
        &self,
        results: &mut mpsc::Receiver<Delivery>,
        agent: &str,
        instance_id: &str,
    ) -> ConclaveResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.config.response_timeout;
        loop {
            let delivery = match tokio::time::timeout_at(deadline, results.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => {
                    return Err(ConclaveError::Bus("task results subscription closed".into()))
                }
                Ok(Some(delivery)) => delivery,
            };
            let envelope = delivery.envelope;
            if envelope.metadata(WORKFLOW_INSTANCE_KEY) != Some(instance_id) {
                debug!(source = %envelope.source, "Ignoring result for another workflow");
                continue;
            }
            match envelope.decode::<AgentTaskResponse>() {
                Ok(resp) if resp.name.as_deref() == Some(agent) => return Ok(Some(resp.content)),
                Ok(resp) => debug!(from = ?resp.name, expected = %agent, "Ignoring result from another agent"),
                Err(e) => warn!(error = %e, "Ignoring malformed task result"),
            }
        }
    }
}
