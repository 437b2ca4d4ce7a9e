use async_trait::async_trait;
use conclave_core::{ConclaveResult, EventEnvelope, EventMessage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Routes envelopes of one event type to a handler path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Envelope `type` this rule matches.
    pub event_type: String,
    /// Handler path the delivery is tagged with.
    pub route: String,
}

impl RouteRule {
    /// Rule matching the message model `M`.
    pub fn for_message<M: EventMessage>(route: impl Into<String>) -> Self {
        Self {
            event_type: M::EVENT_TYPE.to_string(),
            route: route.into(),
        }
    }

    /// The condition in Dapr's `event.type == '...'` notation.
    pub fn match_condition(&self) -> String {
        format!("event.type == '{}'", self.event_type)
    }
}

/// Interest in one topic of one bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Bus name.
    pub pubsub_name: String,
    /// Topic name.
    pub topic: String,
    /// Routing rules. Empty means every event on the topic is delivered.
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    /// Where envelopes that could not be handled are republished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_topic: Option<String>,
}

impl Subscription {
    /// A subscription without rules.
    pub fn new(pubsub_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            pubsub_name: pubsub_name.into(),
            topic: topic.into(),
            rules: Vec::new(),
            dead_letter_topic: None,
        }
    }

    /// Sets the dead-letter topic.
    pub fn with_dead_letter(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Adds a rule unless an identical one already exists.
    pub fn add_rule(&mut self, rule: RouteRule) -> bool {
        if self.rules.contains(&rule) {
            return false;
        }
        debug!(condition = %rule.match_condition(), route = %rule.route, "Added match condition");
        self.rules.push(rule);
        true
    }

    /// Default handler path for this topic.
    pub fn default_route(&self) -> String {
        format!("/events/{}/{}", self.pubsub_name, self.topic)
    }

    /// Returns the route an envelope is delivered under, or `None` if this
    /// subscription does not want it.
    pub fn route_for(&self, envelope: &EventEnvelope) -> Option<String> {
        if envelope.pubsub_name != self.pubsub_name || envelope.topic != self.topic {
            return None;
        }
        if self.rules.is_empty() {
            return Some(self.default_route());
        }
        self.rules
            .iter()
            .find(|r| r.event_type == envelope.event_type)
            .map(|r| r.route.clone())
    }
}

/// The subscriptions one service declares, merged per (bus, topic).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the subscription for (`pubsub_name`, `topic`), creating it if needed.
    pub fn register(
        &mut self,
        pubsub_name: &str,
        topic: &str,
        dead_letter_topic: Option<&str>,
    ) -> &mut Subscription {
        let idx = match self
            .subscriptions
            .iter()
            .position(|s| s.pubsub_name == pubsub_name && s.topic == topic)
        {
            Some(idx) => idx,
            None => {
                let mut sub = Subscription::new(pubsub_name, topic);
                sub.dead_letter_topic = dead_letter_topic.map(str::to_string);
                self.subscriptions.push(sub);
                info!(pubsub = %pubsub_name, topic = %topic, "Created new subscription");
                self.subscriptions.len() - 1
            }
        };
        &mut self.subscriptions[idx]
    }

    /// All subscriptions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no subscription is registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dapr `/subscribe` representation.
    pub fn to_dapr_json(&self) -> serde_json::Value {
        let subs: Vec<serde_json::Value> = self
            .subscriptions
            .iter()
            .map(|s| {
                let rules: Vec<serde_json::Value> = s
                    .rules
                    .iter()
                    .map(|r| serde_json::json!({"match": r.match_condition(), "path": r.route}))
                    .collect();
                let mut entry = serde_json::json!({
                    "pubsubname": s.pubsub_name,
                    "topic": s.topic,
                    "routes": {"rules": rules},
                });
                if let Some(dl) = &s.dead_letter_topic {
                    entry["deadLetterTopic"] = serde_json::json!(dl);
                }
                entry
            })
            .collect();
        serde_json::Value::Array(subs)
    }
}

/// An envelope handed to a subscriber, tagged with the matching route.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The event.
    pub envelope: EventEnvelope,
    /// Route of the rule that matched.
    pub route: String,
}

/// Publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Name of the bus (`pubsubname` on envelopes).
    fn name(&self) -> &str;

    /// Publishes an envelope. Returns how many local subscribers received it.
    async fn publish(&self, envelope: EventEnvelope) -> ConclaveResult<usize>;

    /// Delivers to local subscribers only, without forwarding to remote peers.
    async fn deliver_local(&self, envelope: EventEnvelope) -> ConclaveResult<usize> {
        self.publish(envelope).await
    }

    /// Registers a subscription and returns its delivery stream.
    fn subscribe(&self, subscription: Subscription) -> mpsc::Receiver<Delivery>;
}

/// Republishes `envelope` to the subscription's dead-letter topic, if any.
pub async fn dead_letter(
    bus: &dyn MessageBus,
    subscription: &Subscription,
    envelope: &EventEnvelope,
    reason: &str,
) -> ConclaveResult<bool> {
    let Some(topic) = &subscription.dead_letter_topic else {
        warn!(event_id = %envelope.id, reason = %reason, "Dropping event without dead-letter topic");
        return Ok(false);
    };
    let dead = envelope
        .redirect(topic.clone())
        .with_metadata("dead_letter_reason", reason)
        .with_metadata("original_topic", envelope.topic.clone());
    warn!(event_id = %envelope.id, dead_letter_topic = %topic, reason = %reason, "Event dead-lettered");
    bus.publish(dead).await?;
    Ok(true)
}

struct Subscriber {
    id: u64,
    subscription: Subscription,
    tx: mpsc::Sender<Delivery>,
}

/// In-process bus. Each subscriber owns a bounded channel, so a slow
/// subscriber applies backpressure to publishers of its topics.
pub struct InMemoryMessageBus {
    name: String,
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl InMemoryMessageBus {
    /// Creates a bus with per-subscriber channel capacity.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn prune(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        self.subscribers.write().retain(|s| !dead.contains(&s.id));
        debug!(count = dead.len(), "Pruned closed subscribers");
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, envelope: EventEnvelope) -> ConclaveResult<usize> {
        let targets: Vec<(u64, String, mpsc::Sender<Delivery>)> = {
            let subs = self.subscribers.read();
            subs.iter()
                .filter_map(|s| {
                    s.subscription
                        .route_for(&envelope)
                        .map(|route| (s.id, route, s.tx.clone()))
                })
                .collect()
        };

        if targets.is_empty() {
            debug!(
                topic = %envelope.topic,
                event_type = %envelope.event_type,
                "No subscriber for event"
            );
            return Ok(0);
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, route, tx) in targets {
            let delivery = Delivery {
                envelope: envelope.clone(),
                route,
            };
            if tx.send(delivery).await.is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }
        self.prune(&dead);

        debug!(
            topic = %envelope.topic,
            event_type = %envelope.event_type,
            delivered,
            "Event published"
        );
        Ok(delivered)
    }

    fn subscribe(&self, subscription: Subscription) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            pubsub = %subscription.pubsub_name,
            topic = %subscription.topic,
            rules = subscription.rules.len(),
            "Subscribed"
        );
        self.subscribers.write().push(Subscriber {
            id,
            subscription,
            tx,
        });
        rx
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conclave_core::{AgentTaskResponse, BaseMessage, TriggerAction};
    use std::time::Duration;

    fn envelope<M: EventMessage>(topic: &str, msg: &M) -> EventEnvelope {
        EventEnvelope::new("tester", topic, "messagepubsub", msg).unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers_only() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let mut gimli = bus.subscribe(Subscription::new("messagepubsub", "Gimli"));
        let mut legolas = bus.subscribe(Subscription::new("messagepubsub", "Legolas"));

        let n = bus
            .publish(envelope("Gimli", &TriggerAction::with_task("dig", 1)))
            .await
            .unwrap();
        assert_eq!(n, 1);

        let got = gimli.recv().await.unwrap();
        assert_eq!(got.envelope.topic, "Gimli");
        assert_eq!(got.route, "/events/messagepubsub/Gimli");
        assert!(legolas.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rules_filter_by_event_type() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let mut sub = Subscription::new("messagepubsub", "task_results_channel");
        sub.add_rule(RouteRule::for_message::<AgentTaskResponse>("/results"));
        let mut rx = bus.subscribe(sub);

        let skipped = bus
            .publish(envelope("task_results_channel", &BaseMessage::user("noise")))
            .await
            .unwrap();
        assert_eq!(skipped, 0);

        bus.publish(envelope(
            "task_results_channel",
            &AgentTaskResponse::new("Gimli", "done"),
        ))
        .await
        .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.route, "/results");
        assert!(got.envelope.is::<AgentTaskResponse>());
    }

    #[tokio::test]
    async fn test_other_bus_name_is_not_delivered() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let mut rx = bus.subscribe(Subscription::new("otherbus", "t"));
        bus.publish(envelope("t", &BaseMessage::user("x"))).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let rx = bus.subscribe(Subscription::new("messagepubsub", "t"));
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        let n = bus.publish(envelope("t", &BaseMessage::user("x"))).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_applies_backpressure() {
        let bus = std::sync::Arc::new(InMemoryMessageBus::new("messagepubsub", 1));
        let mut rx = bus.subscribe(Subscription::new("messagepubsub", "t"));
        bus.publish(envelope("t", &BaseMessage::user("1"))).await.unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(envelope("t", &BaseMessage::user("2"))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        rx.recv().await.unwrap();
        let n = publisher.await.unwrap().unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_republishes_with_reason() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let sub = Subscription::new("messagepubsub", "Gimli").with_dead_letter("Gimli_dead_letter");
        let mut dl = bus.subscribe(Subscription::new("messagepubsub", "Gimli_dead_letter"));

        let env = envelope("Gimli", &TriggerAction::with_task("dig", 1));
        assert!(dead_letter(&bus, &sub, &env, "agent failed").await.unwrap());

        let got = dl.recv().await.unwrap();
        assert_eq!(got.envelope.id, env.id);
        assert_eq!(got.envelope.metadata("dead_letter_reason"), Some("agent failed"));
        assert_eq!(got.envelope.metadata("original_topic"), Some("Gimli"));
    }

    #[tokio::test]
    async fn test_dead_letter_without_topic_drops() {
        let bus = InMemoryMessageBus::new("messagepubsub", 8);
        let sub = Subscription::new("messagepubsub", "Gimli");
        let env = envelope("Gimli", &TriggerAction::default());
        assert!(!dead_letter(&bus, &sub, &env, "x").await.unwrap());
    }

    #[test]
    fn test_subscription_set_merges_rules() {
        let mut set = SubscriptionSet::new();
        set.register("messagepubsub", "Gimli", None)
            .add_rule(RouteRule::for_message::<TriggerAction>("/trigger"));
        let again = set.register("messagepubsub", "Gimli", Some("ignored"));
        assert!(!again.add_rule(RouteRule::for_message::<TriggerAction>("/trigger")));
        assert!(again.add_rule(RouteRule::for_message::<BaseMessage>("/message")));
        assert_eq!(set.len(), 1);
        assert!(set.iter().next().unwrap().dead_letter_topic.is_none());

        let json = set.to_dapr_json();
        assert_eq!(json[0]["routes"]["rules"][0]["match"], "event.type == 'TriggerAction'");
        assert_eq!(json[0]["routes"]["rules"].as_array().unwrap().len(), 2);
    }
}
