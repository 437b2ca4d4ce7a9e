use crate::error::{ConclaveError, ConclaveResult};
use crate::message::{AgentTaskResponse, BaseMessage, TriggerAction};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A payload type that can travel on the bus.
///
/// `EVENT_TYPE` is written into the envelope's `type` field and is what
/// subscription rules match on.
pub trait EventMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Stable type name of the message model.
    const EVENT_TYPE: &'static str;
}

impl EventMessage for BaseMessage {
    const EVENT_TYPE: &'static str = "BaseMessage";
}

impl EventMessage for AgentTaskResponse {
    const EVENT_TYPE: &'static str = "AgentTaskResponse";
}

impl EventMessage for TriggerAction {
    const EVENT_TYPE: &'static str = "TriggerAction";
}

/// CloudEvents-shaped envelope wrapping every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event id.
    pub id: String,
    /// Name of the publishing agent or orchestrator.
    pub source: String,
    /// Message model name, see [`EventMessage::EVENT_TYPE`].
    #[serde(rename = "type")]
    pub event_type: String,
    /// Topic the event was published to.
    pub topic: String,
    /// Bus the event was published on.
    #[serde(rename = "pubsubname")]
    pub pubsub_name: String,
    /// CloudEvents spec version.
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    /// Content type of `data`.
    #[serde(default = "default_content_type")]
    pub datacontenttype: String,
    /// Publication time.
    pub time: DateTime<Utc>,
    /// The serialized message.
    pub data: serde_json::Value,
    /// Extra attributes supplied by the publisher.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_spec_version() -> String {
    "1.0".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl EventEnvelope {
    /// Wraps `message` for publication on `pubsub_name`/`topic`.
    pub fn new<M: EventMessage>(
        source: impl Into<String>,
        topic: impl Into<String>,
        pubsub_name: impl Into<String>,
        message: &M,
    ) -> ConclaveResult<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: M::EVENT_TYPE.to_string(),
            topic: topic.into(),
            pubsub_name: pubsub_name.into(),
            specversion: default_spec_version(),
            datacontenttype: default_content_type(),
            time: Utc::now(),
            data: serde_json::to_value(message)?,
            metadata: BTreeMap::new(),
        })
    }

    /// Attaches an extra attribute.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reads an extra attribute.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Whether the envelope carries a `M`.
    pub fn is<M: EventMessage>(&self) -> bool {
        self.event_type == M::EVENT_TYPE
    }

    /// Decodes the payload, failing if the envelope holds a different message type.
    pub fn decode<M: EventMessage>(&self) -> ConclaveResult<M> {
        if !self.is::<M>() {
            return Err(ConclaveError::Bus(format!(
                "expected event type '{}', got '{}'",
                M::EVENT_TYPE,
                self.event_type
            )));
        }
        serde_json::from_value(self.data.clone()).map_err(|e| {
            ConclaveError::Bus(format!("malformed {} payload: {e}", self.event_type))
        })
    }

    /// Copy of this envelope re-addressed to another topic.
    pub fn redirect(&self, topic: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.topic = topic.into();
        copy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_type_name() {
        let trigger = TriggerAction::with_task("Scout the mines", 1);
        let env = EventEnvelope::new("Orchestrator", "Gimli", "messagepubsub", &trigger).unwrap();
        assert_eq!(env.event_type, "TriggerAction");
        assert!(env.is::<TriggerAction>());
        assert!(!env.is::<BaseMessage>());
        assert_eq!(env.decode::<TriggerAction>().unwrap(), trigger);
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let env = EventEnvelope::new("a", "t", "bus", &BaseMessage::user("hi")).unwrap();
        let err = env.decode::<TriggerAction>().unwrap_err();
        assert!(err.to_string().contains("expected event type 'TriggerAction'"));
    }

    #[test]
    fn test_wire_format_uses_cloudevent_names() {
        let env = EventEnvelope::new("a", "t", "bus", &BaseMessage::user("hi"))
            .unwrap()
            .with_metadata("workflow_instance_id", "wf-1");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "BaseMessage");
        assert_eq!(json["pubsubname"], "bus");
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["metadata"]["workflow_instance_id"], "wf-1");
        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata("workflow_instance_id"), Some("wf-1"));
    }

    #[test]
    fn test_redirect_keeps_identity() {
        let env = EventEnvelope::new("a", "t", "bus", &BaseMessage::user("hi")).unwrap();
        let moved = env.redirect("t_dead_letter");
        assert_eq!(moved.id, env.id);
        assert_eq!(moved.topic, "t_dead_letter");
    }
}
