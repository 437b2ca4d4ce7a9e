use serde::{Deserialize, Serialize};

/// Topic every agent listens on for shared conversation.
pub const DEFAULT_BROADCAST_TOPIC: &str = "beacon_channel";
/// Topic agents publish task results to.
pub const DEFAULT_TASK_RESULTS_TOPIC: &str = "task_results_channel";

/// Where a hosted participant listens and publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Topic triggers arrive on. Defaults to the participant's name.
    #[serde(default)]
    pub agent_topic_name: Option<String>,
    /// Topic conversation updates are shared on.
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic_name: String,
    /// Topic answers to triggers are published on.
    #[serde(default = "default_task_results_topic")]
    pub task_results_topic_name: String,
    /// Address the HTTP server binds.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the HTTP server binds.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_broadcast_topic() -> String {
    DEFAULT_BROADCAST_TOPIC.to_string()
}

fn default_task_results_topic() -> String {
    DEFAULT_TASK_RESULTS_TOPIC.to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            agent_topic_name: None,
            broadcast_topic_name: default_broadcast_topic(),
            task_results_topic_name: default_task_results_topic(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServiceConfig {
    /// The trigger topic for a participant called `name`.
    pub fn topic_for(&self, name: &str) -> String {
        self.agent_topic_name
            .clone()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}_dead_letter")
}
