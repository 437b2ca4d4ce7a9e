use crate::config::{dead_letter_topic, ServiceConfig};
use crate::messenger::{Messenger, WORKFLOW_INSTANCE_KEY};
use conclave_agent::Agent;
use conclave_bus::{
    dead_letter, AgentMetadata, AgentRegistry, Delivery, MessageBus, RouteRule, Subscription,
    SubscriptionSet,
};
use conclave_core::{
    AgentTaskResponse, BaseMessage, ConclaveError, ConclaveResult, EventEnvelope, TriggerAction,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Route triggers are delivered under.
pub const TRIGGER_ROUTE: &str = "/AgentTask";
/// Route broadcast messages are delivered under.
pub const BROADCAST_ROUTE: &str = "/BroadcastMessage";

/// Hosts an [`Agent`] on the bus: registers it, consumes its triggers and
/// keeps its memory in sync with the team's broadcasts.
pub struct AgentService {
    agent: Arc<Agent>,
    messenger: Messenger,
    config: ServiceConfig,
    agent_topic: String,
    subscriptions: RwLock<SubscriptionSet>,
}

/// A started [`AgentService`]. Dropping the handle leaves the loop running;
/// call [`ServiceHandle::stop`] to shut it down.
pub struct ServiceHandle {
    service: Arc<AgentService>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AgentService {
    /// Wraps `agent`. Nothing is subscribed until [`AgentService::start`].
    pub fn new(
        agent: Arc<Agent>,
        bus: Arc<dyn MessageBus>,
        registry: AgentRegistry,
        config: ServiceConfig,
    ) -> Self {
        let agent_topic = config.topic_for(agent.name());
        let messenger = Messenger::new(
            agent.name(),
            bus,
            registry,
            config.broadcast_topic_name.clone(),
            config.task_results_topic_name.clone(),
        );
        Self {
            agent,
            messenger,
            config,
            agent_topic,
            subscriptions: RwLock::new(SubscriptionSet::new()),
        }
    }

    /// Agent name.
    pub fn name(&self) -> &str {
        self.agent.name()
    }

    /// Hosted agent.
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Outbound messaging for this agent.
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Service settings.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Topic this agent receives triggers on.
    pub fn agent_topic(&self) -> &str {
        &self.agent_topic
    }

    /// Bus the service is attached to.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        self.messenger.bus()
    }

    /// Subscriptions declared by [`AgentService::start`], Dapr-shaped.
    pub fn subscriptions_json(&self) -> serde_json::Value {
        self.subscriptions.read().to_dapr_json()
    }

    /// Registry entry for this agent.
    pub fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            name: self.agent.name().to_string(),
            role: self.agent.role().to_string(),
            goal: self.agent.goal().to_string(),
            topic_name: self.agent_topic.clone(),
            pubsub_name: self.bus().name().to_string(),
            orchestrator: false,
        }
    }

    /// Registers the agent, subscribes to its topics and spawns the dispatch loop.
    pub async fn start(self: &Arc<Self>) -> ConclaveResult<ServiceHandle> {
        self.messenger.registry().register(self.metadata()).await?;

        let pubsub = self.bus().name().to_string();
        let (trigger_sub, broadcast_sub) = {
            let mut set = self.subscriptions.write();
            let dead_letter = dead_letter_topic(&self.agent_topic);
            let sub = set.register(&pubsub, &self.agent_topic, Some(&dead_letter));
            sub.add_rule(RouteRule::for_message::<TriggerAction>(TRIGGER_ROUTE));
            let trigger_sub = sub.clone();

            let broadcast_dead_letter = dead_letter_topic(&self.config.broadcast_topic_name);
            let sub = set.register(
                &pubsub,
                &self.config.broadcast_topic_name,
                Some(&broadcast_dead_letter),
            );
            sub.add_rule(RouteRule::for_message::<BaseMessage>(BROADCAST_ROUTE));
            sub.add_rule(RouteRule::for_message::<AgentTaskResponse>(BROADCAST_ROUTE));
            (trigger_sub, sub.clone())
        };

        let triggers = self.bus().subscribe(trigger_sub.clone());
        let broadcasts = self.bus().subscribe(broadcast_sub);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let service = Arc::clone(self);
        let task = tokio::spawn(async move {
            service
                .dispatch(trigger_sub, triggers, broadcasts, shutdown_rx)
                .await;
        });

        info!(agent = %self.name(), topic = %self.agent_topic, "Agent service started");
        Ok(ServiceHandle {
            service: Arc::clone(self),
            shutdown,
            task,
        })
    }

    /// Broadcasts are drained first so a trigger always sees the shared
    /// context published before it. Triggers run one at a time.
    async fn dispatch(
        &self,
        trigger_sub: Subscription,
        mut triggers: mpsc::Receiver<Delivery>,
        mut broadcasts: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(delivery) = broadcasts.recv() => {
                    self.handle_broadcast(delivery.envelope);
                }
                Some(delivery) = triggers.recv() => {
                    self.handle_trigger(&trigger_sub, delivery.envelope).await;
                }
                else => break,
            }
        }
        debug!(agent = %self.name(), "Dispatch loop finished");
    }

    async fn handle_trigger(&self, subscription: &Subscription, envelope: EventEnvelope) {
        if let Err(e) = self.process_trigger(&envelope).await {
            error!(agent = %self.name(), event_id = %envelope.id, error = %e, "Task failed");
            if let Err(e) = dead_letter(
                self.bus().as_ref(),
                subscription,
                &envelope,
                &e.to_string(),
            )
            .await
            {
                error!(agent = %self.name(), error = %e, "Failed to dead-letter trigger");
            }
        }
    }

    async fn process_trigger(&self, envelope: &EventEnvelope) -> ConclaveResult<()> {
        let trigger: TriggerAction = envelope.decode()?;
        let instance = trigger
            .workflow_instance_id
            .clone()
            .or_else(|| envelope.metadata(WORKFLOW_INSTANCE_KEY).map(str::to_string));
        info!(
            agent = %self.name(),
            source = %envelope.source,
            iteration = trigger.iteration,
            "Received trigger"
        );

        let reply = self.agent.run(trigger.task.as_deref()).await?;
        self.messenger
            .publish_task_result(
                &AgentTaskResponse::new(self.name(), reply),
                instance.as_deref(),
            )
            .await
    }

    fn handle_broadcast(&self, envelope: EventEnvelope) {
        if envelope.source == self.name() {
            debug!(agent = %self.name(), "Skipping own broadcast");
            return;
        }
        let message: ConclaveResult<BaseMessage> = if envelope.is::<AgentTaskResponse>() {
            envelope.decode::<AgentTaskResponse>().map(Into::into)
        } else {
            envelope.decode::<BaseMessage>()
        };
        match message {
            // Replies relayed back to their author are already in memory
            Ok(msg) if msg.name.as_deref() == Some(self.name()) => {}
            Ok(msg) => {
                debug!(agent = %self.name(), from = %envelope.source, "Stored broadcast message");
                self.agent.add_message(msg);
            }
            Err(e) => warn!(agent = %self.name(), error = %e, "Ignoring malformed broadcast"),
        }
    }

    /// Shares `message` with the team.
    pub async fn broadcast_message(&self, message: &BaseMessage) -> ConclaveResult<()> {
        self.messenger.broadcast_message(message).await
    }

    /// Sends `message` directly to `agent`.
    pub async fn send_message_to_agent(
        &self,
        agent: &str,
        message: &BaseMessage,
    ) -> ConclaveResult<()> {
        self.messenger.send_message_to_agent(agent, message, &[]).await
    }

    /// Publishes an answer outside of a workflow.
    pub async fn publish_task_result(&self, response: &AgentTaskResponse) -> ConclaveResult<()> {
        self.messenger.publish_task_result(response, None).await
    }

    /// Runs a task directly, outside any workflow.
    pub async fn invoke_task(&self, task: Option<&str>) -> ConclaveResult<String> {
        self.agent.run(task).await
    }

    /// Stores a message in the agent's memory.
    pub fn add_message(&self, message: BaseMessage) {
        self.agent.add_message(message);
    }

    /// The agent's memory.
    pub fn get_messages(&self) -> Vec<BaseMessage> {
        self.agent.messages()
    }

    /// Injects an envelope received over HTTP into the local bus.
    pub async fn receive_event(&self, envelope: EventEnvelope) -> ConclaveResult<usize> {
        if envelope.pubsub_name != self.bus().name() {
            return Err(ConclaveError::Bus(format!(
                "event for bus '{}' received by bus '{}'",
                envelope.pubsub_name,
                self.bus().name()
            )));
        }
        self.bus().deliver_local(envelope).await
    }
}

impl ServiceHandle {
    /// The running service.
    pub fn service(&self) -> &Arc<AgentService> {
        &self.service
    }

    /// Deregisters the agent and waits for the dispatch loop to exit.
    pub async fn stop(self) -> ConclaveResult<()> {
        let deregistered = self
            .service
            .messenger
            .registry()
            .deregister(self.service.name())
            .await;
        // The loop may already have exited if the bus dropped its senders
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| ConclaveError::Agent(format!("dispatch task failed: {e}")))?;
        info!(agent = %self.service.name(), "Agent service stopped");
        deregistered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_agent::{AgentConfig, LlmClient, ScriptedBackend};
    use conclave_bus::{InMemoryMessageBus, InMemoryStateStore};
    use std::time::Duration;

    struct Fixture {
        bus: Arc<InMemoryMessageBus>,
        registry: AgentRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bus: Arc::new(InMemoryMessageBus::new("messagepubsub", 16)),
                registry: AgentRegistry::new(
                    Arc::new(InMemoryStateStore::new("agentsregistrystore")),
                    "agents_registry",
                ),
            }
        }

        fn service(&self, name: &str, backend: ScriptedBackend) -> Arc<AgentService> {
            let agent = Agent::new(
                AgentConfig::new(name),
                LlmClient::from_backend(Box::new(backend)),
            );
            Arc::new(AgentService::new(
                Arc::new(agent),
                self.bus.clone(),
                self.registry.clone(),
                ServiceConfig::default(),
            ))
        }

        async fn trigger(&self, topic: &str, trigger: &TriggerAction) {
            let env = EventEnvelope::new("Orchestrator", topic, "messagepubsub", trigger).unwrap();
            self.bus.publish(env).await.unwrap();
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Delivery>) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .envelope
    }

    #[tokio::test]
    async fn test_trigger_publishes_result_with_instance() {
        let fx = Fixture::new();
        let mut results = fx
            .bus
            .subscribe(Subscription::new("messagepubsub", "task_results_channel"));
        let svc = fx.service("Gandalf", ScriptedBackend::new(["You shall not pass"]));
        let handle = svc.start().await.unwrap();

        fx.trigger(
            "Gandalf",
            &TriggerAction::with_task("Hold the bridge", 1).for_instance("wf-9"),
        )
        .await;

        let env = next(&mut results).await;
        let resp: AgentTaskResponse = env.decode().unwrap();
        assert_eq!(resp.content, "You shall not pass");
        assert_eq!(resp.name.as_deref(), Some("Gandalf"));
        assert_eq!(env.metadata(WORKFLOW_INSTANCE_KEY), Some("wf-9"));

        handle.stop().await.unwrap();
        assert!(fx.registry.get("Gandalf").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_trigger_is_dead_lettered() {
        let fx = Fixture::new();
        let mut dead = fx
            .bus
            .subscribe(Subscription::new("messagepubsub", "Boromir_dead_letter"));
        let svc = fx.service("Boromir", ScriptedBackend::new(Vec::<String>::new()));
        let handle = svc.start().await.unwrap();

        fx.trigger("Boromir", &TriggerAction::with_task("Resist the ring", 1))
            .await;

        let env = next(&mut dead).await;
        assert_eq!(env.metadata("original_topic"), Some("Boromir"));
        assert!(env.metadata("dead_letter_reason").is_some());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcasts_fill_memory_except_own() {
        let fx = Fixture::new();
        let svc = fx.service("Sam", ScriptedBackend::new(Vec::<String>::new()));
        let handle = svc.start().await.unwrap();

        let from_frodo = EventEnvelope::new(
            "Frodo",
            "beacon_channel",
            "messagepubsub",
            &BaseMessage::user("Po-tay-toes?").with_name("Frodo"),
        )
        .unwrap();
        let own = EventEnvelope::new(
            "Sam",
            "beacon_channel",
            "messagepubsub",
            &BaseMessage::user("Boil 'em"),
        )
        .unwrap();
        let relayed = EventEnvelope::new(
            "Orchestrator",
            "beacon_channel",
            "messagepubsub",
            &AgentTaskResponse::new("Sam", "Mash 'em"),
        )
        .unwrap();
        fx.bus.publish(own).await.unwrap();
        fx.bus.publish(relayed).await.unwrap();
        fx.bus.publish(from_frodo).await.unwrap();

        for _ in 0..50 {
            if !svc.get_messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let memory = svc.get_messages();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory[0].content, "Po-tay-toes?");
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_registers_and_declares_subscriptions() {
        let fx = Fixture::new();
        let svc = fx.service("Legolas", ScriptedBackend::new(Vec::<String>::new()));
        let handle = svc.start().await.unwrap();

        let meta = fx.registry.get("Legolas").await.unwrap();
        assert_eq!(meta.topic_name, "Legolas");
        assert_eq!(meta.pubsub_name, "messagepubsub");

        let subs = svc.subscriptions_json();
        let subs = subs.as_array().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0]["deadLetterTopic"], "Legolas_dead_letter");
        assert_eq!(subs[1]["routes"]["rules"].as_array().unwrap().len(), 2);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_event_rejects_foreign_bus() {
        let fx = Fixture::new();
        let svc = fx.service("Gimli", ScriptedBackend::new(Vec::<String>::new()));
        let env =
            EventEnvelope::new("x", "Gimli", "otherbus", &TriggerAction::default()).unwrap();
        assert!(svc.receive_event(env).await.is_err());
    }
}
