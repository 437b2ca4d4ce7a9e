use conclave_bus::{AgentRegistry, MessageBus};
use conclave_core::{
    AgentTaskResponse, BaseMessage, ConclaveError, ConclaveResult, EventEnvelope, EventMessage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata key carrying the workflow instance an event belongs to.
pub const WORKFLOW_INSTANCE_KEY: &str = "workflow_instance_id";

/// Publishing side of a participant: wraps messages in envelopes stamped
/// with the participant's name and sends them to teammates.
#[derive(Clone)]
pub struct Messenger {
    source: String,
    bus: Arc<dyn MessageBus>,
    registry: AgentRegistry,
    broadcast_topic: String,
    task_results_topic: String,
}

impl Messenger {
    /// Messenger publishing as `source`.
    pub fn new(
        source: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        registry: AgentRegistry,
        broadcast_topic: impl Into<String>,
        task_results_topic: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            bus,
            registry,
            broadcast_topic: broadcast_topic.into(),
            task_results_topic: task_results_topic.into(),
        }
    }

    /// Name stamped on every outgoing envelope.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Underlying bus.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Registry used to find recipients.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Topic broadcasts go to.
    pub fn broadcast_topic(&self) -> &str {
        &self.broadcast_topic
    }

    /// Topic task results go to.
    pub fn task_results_topic(&self) -> &str {
        &self.task_results_topic
    }

    /// Wraps and publishes `message` on `pubsub`/`topic`.
    pub async fn publish<M: EventMessage>(
        &self,
        pubsub: &str,
        topic: &str,
        message: &M,
        metadata: &[(&str, &str)],
    ) -> ConclaveResult<usize> {
        let mut envelope = EventEnvelope::new(self.source.clone(), topic, pubsub, message)?;
        for (key, value) in metadata {
            envelope = envelope.with_metadata(*key, *value);
        }
        debug!(
            source = %self.source,
            topic = %topic,
            event_type = M::EVENT_TYPE,
            "Publishing event"
        );
        self.bus.publish(envelope).await
    }

    /// Shares `message` with every other registered agent.
    /// Does nothing when nobody else is registered.
    pub async fn broadcast_message(&self, message: &BaseMessage) -> ConclaveResult<()> {
        let others = self.registry.agents_excluding(&self.source).await;
        if others.is_empty() {
            warn!(source = %self.source, "No agents available for broadcast");
            return Ok(());
        }
        let pubsub = self.bus.name().to_string();
        self.publish(&pubsub, &self.broadcast_topic, message, &[])
            .await?;
        info!(source = %self.source, recipients = others.len(), "Broadcast message sent");
        Ok(())
    }

    /// Sends `message` to the topic `agent` registered.
    pub async fn send_message_to_agent<M: EventMessage>(
        &self,
        agent: &str,
        message: &M,
        metadata: &[(&str, &str)],
    ) -> ConclaveResult<()> {
        let target = self
            .registry
            .get(agent)
            .await
            .ok_or_else(|| ConclaveError::Registry(format!("agent '{agent}' not found")))?;
        self.publish(&target.pubsub_name, &target.topic_name, message, metadata)
            .await?;
        info!(source = %self.source, target = %agent, event_type = M::EVENT_TYPE, "Message sent");
        Ok(())
    }

    /// Publishes a task result, tagged with its workflow instance when known.
    pub async fn publish_task_result(
        &self,
        response: &AgentTaskResponse,
        workflow_instance_id: Option<&str>,
    ) -> ConclaveResult<()> {
        let metadata: Vec<(&str, &str)> = workflow_instance_id
            .map(|id| vec![(WORKFLOW_INSTANCE_KEY, id)])
            .unwrap_or_default();
        let pubsub = self.bus.name().to_string();
        self.publish(&pubsub, &self.task_results_topic, response, &metadata)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_bus::{AgentMetadata, InMemoryMessageBus, InMemoryStateStore, Subscription};
    use conclave_core::TriggerAction;

    async fn setup() -> (Arc<InMemoryMessageBus>, Messenger) {
        let bus = Arc::new(InMemoryMessageBus::new("messagepubsub", 8));
        let registry = AgentRegistry::new(
            Arc::new(InMemoryStateStore::new("agentsregistrystore")),
            "agents_registry",
        );
        let messenger = Messenger::new(
            "Frodo",
            bus.clone(),
            registry,
            "beacon_channel",
            "task_results_channel",
        );
        (bus, messenger)
    }

    fn metadata(name: &str) -> AgentMetadata {
        AgentMetadata {
            name: name.into(),
            role: "Hobbit".into(),
            goal: String::new(),
            topic_name: name.into(),
            pubsub_name: "messagepubsub".into(),
            orchestrator: false,
        }
    }

    #[tokio::test]
    async fn test_broadcast_skipped_when_alone() {
        let (bus, messenger) = setup().await;
        let mut rx = bus.subscribe(Subscription::new("messagepubsub", "beacon_channel"));
        messenger.registry().register(metadata("Frodo")).await.unwrap();

        messenger
            .broadcast_message(&BaseMessage::user("anyone?"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        messenger.registry().register(metadata("Sam")).await.unwrap();
        messenger
            .broadcast_message(&BaseMessage::user("Sam!"))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.envelope.source, "Frodo");
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let (_bus, messenger) = setup().await;
        let err = messenger
            .send_message_to_agent("Gollum", &TriggerAction::with_task("x", 1), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Registry(_)));
    }

    #[tokio::test]
    async fn test_task_result_carries_instance() {
        let (bus, messenger) = setup().await;
        let mut rx = bus.subscribe(Subscription::new("messagepubsub", "task_results_channel"));
        messenger
            .publish_task_result(&AgentTaskResponse::new("Frodo", "done"), Some("wf-1"))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.envelope.metadata(WORKFLOW_INSTANCE_KEY), Some("wf-1"));
    }
}
