use crate::bus::{Delivery, InMemoryMessageBus, MessageBus, Subscription};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult, EventEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bus that forwards topics owned by remote services over HTTP.
///
/// Every publish is delivered to local subscribers first. If the topic has
/// configured peers, the envelope is also POSTed to each
/// `{peer}/events/{pubsub}/{topic}`, where the peer's service re-injects it
/// with [`MessageBus::deliver_local`]. A topic may have several peers, which
/// is how the broadcast topic reaches agents in other processes.
///
/// An unreachable peer does not stop delivery to the others. The publish
/// still fails once every peer has been tried, naming each failure.
pub struct HttpMessageBus {
    local: Arc<InMemoryMessageBus>,
    peers: HashMap<String, Vec<String>>,
    http: reqwest::Client,
}

impl HttpMessageBus {
    /// Wraps a local bus with a topic -> base URL peer map.
    pub fn new(local: Arc<InMemoryMessageBus>, peers: HashMap<String, String>) -> Self {
        let mut bus = Self {
            local,
            peers: HashMap::new(),
            http: reqwest::Client::new(),
        };
        for (topic, url) in peers {
            bus = bus.with_peer(topic, url);
        }
        bus
    }

    /// Adds another peer for `topic`.
    pub fn with_peer(mut self, topic: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        let urls = self.peers.entry(topic.into()).or_default();
        if !urls.contains(&url) {
            urls.push(url);
        }
        self
    }

    /// Base URLs of the peers subscribed to `topic`.
    pub fn peers_for(&self, topic: &str) -> &[String] {
        self.peers.get(topic).map_or(&[], Vec::as_slice)
    }

    async fn forward(&self, peer: &str, envelope: &EventEnvelope) -> ConclaveResult<()> {
        let url = format!("{peer}/events/{}/{}", envelope.pubsub_name, envelope.topic);
        debug!(url = %url, event_id = %envelope.id, "Forwarding event to peer");
        let resp = self
            .http
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ConclaveError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConclaveError::Http(format!(
                "peer {peer} rejected event ({status}): {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    fn name(&self) -> &str {
        self.local.name()
    }

    async fn publish(&self, envelope: EventEnvelope) -> ConclaveResult<usize> {
        let delivered = self.local.publish(envelope.clone()).await?;
        let peers = self.peers_for(&envelope.topic);
        let mut failures = Vec::new();
        for peer in peers {
            match self.forward(peer, &envelope).await {
                Ok(()) => info!(topic = %envelope.topic, peer = %peer, "Event forwarded"),
                Err(e) => {
                    warn!(topic = %envelope.topic, peer = %peer, error = %e, "Forwarding failed");
                    failures.push(e.to_string());
                }
            }
        }
        if !failures.is_empty() {
            return Err(ConclaveError::Http(format!(
                "{} of {} peers for topic '{}' failed: {}",
                failures.len(),
                peers.len(),
                envelope.topic,
                failures.join("; ")
            )));
        }
        Ok(delivered)
    }

    async fn deliver_local(&self, envelope: EventEnvelope) -> ConclaveResult<usize> {
        self.local.publish(envelope).await
    }

    fn subscribe(&self, subscription: Subscription) -> mpsc::Receiver<Delivery> {
        self.local.subscribe(subscription)
    }
}
