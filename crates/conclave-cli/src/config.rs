use conclave_agent::{AgentConfig, ModelConfig};
use conclave_orchestrator::OrchestratorConfig;
use conclave_service::{ServiceConfig, DEFAULT_BROADCAST_TOPIC, DEFAULT_TASK_RESULTS_TOPIC};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Contents of `conclave.toml`.
#[derive(Debug, Deserialize)]
pub struct ConclaveConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub orchestrator: OrchestratorEntry,
}

impl ConclaveConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name()) {
                anyhow::bail!("agent '{}' is configured twice", agent.name());
            }
            if agent.name() == self.orchestrator.name {
                anyhow::bail!("agent '{}' has the orchestrator's name", agent.name());
            }
        }
        if self.orchestrator.max_iterations == 0 {
            anyhow::bail!("orchestrator.max_iterations must be at least 1");
        }
        Ok(())
    }

    pub fn agent(&self, name: &str) -> anyhow::Result<&AgentEntry> {
        self.agents
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| anyhow::anyhow!("no agent named '{name}' in config"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PeerUrls {
    One(String),
    Many(Vec<String>),
}

impl PeerUrls {
    pub fn urls(&self) -> Vec<String> {
        match self {
            PeerUrls::One(url) => vec![url.clone()],
            PeerUrls::Many(urls) => urls.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_name")]
    pub name: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,
    #[serde(default = "default_task_results_topic")]
    pub task_results_topic: String,
    /// Topic -> base URL(s) of the services subscribed to it. Empty keeps
    /// the bus in-process.
    #[serde(default)]
    pub peers: HashMap<String, PeerUrls>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            capacity: default_capacity(),
            broadcast_topic: default_broadcast_topic(),
            task_results_topic: default_task_results_topic(),
            peers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Memory,
    /// SQLite databases under `dir`, shared by every process on the host.
    #[serde(alias = "file")]
    Sqlite,
}

#[derive(Debug, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_backend")]
    pub backend: StateBackend,
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_workflow_store")]
    pub workflow_store: String,
    #[serde(default = "default_workflow_key")]
    pub workflow_key: String,
    #[serde(default = "default_registry_store")]
    pub registry_store: String,
    #[serde(default = "default_registry_key")]
    pub registry_key: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            dir: default_state_dir(),
            workflow_store: default_workflow_store(),
            workflow_key: default_workflow_key(),
            registry_store: default_registry_store(),
            registry_key: default_registry_key(),
        }
    }
}

/// One `[[agents]]` table.
#[derive(Debug, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub agent: AgentConfig,
    /// Model override; the top-level `[model]` otherwise.
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

impl AgentEntry {
    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn service_config(&self, bus: &BusConfig) -> ServiceConfig {
        ServiceConfig {
            agent_topic_name: self.topic.clone(),
            broadcast_topic_name: bus.broadcast_topic.clone(),
            task_results_topic_name: bus.task_results_topic.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    RoundRobin,
    Llm,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorEntry {
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default = "default_strategy")]
    pub kind: StrategyKind,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_host")]
    pub host: String,
    /// Port task results are received on when the bus spans processes.
    #[serde(default = "default_orchestrator_port")]
    pub port: u16,
}

impl Default for OrchestratorEntry {
    fn default() -> Self {
        Self {
            name: default_orchestrator_name(),
            kind: default_strategy(),
            max_iterations: default_max_iterations(),
            response_timeout_secs: default_response_timeout(),
            host: default_host(),
            port: default_orchestrator_port(),
        }
    }
}

impl OrchestratorEntry {
    pub fn engine_config(&self, bus: &BusConfig) -> OrchestratorConfig {
        OrchestratorConfig {
            name: self.name.clone(),
            max_iterations: self.max_iterations,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            broadcast_topic: bus.broadcast_topic.clone(),
            task_results_topic: bus.task_results_topic.clone(),
        }
    }
}

fn default_bus_name() -> String {
    "messagepubsub".to_string()
}
fn default_capacity() -> usize {
    256
}
fn default_broadcast_topic() -> String {
    DEFAULT_BROADCAST_TOPIC.to_string()
}
fn default_task_results_topic() -> String {
    DEFAULT_TASK_RESULTS_TOPIC.to_string()
}
fn default_state_backend() -> StateBackend {
    StateBackend::Memory
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./data/state")
}
fn default_workflow_store() -> String {
    "agenticworkflowstate".to_string()
}
fn default_workflow_key() -> String {
    "workflow_state".to_string()
}
fn default_registry_store() -> String {
    "agentsregistrystore".to_string()
}
fn default_registry_key() -> String {
    "agents_registry".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_agent_port() -> u16 {
    8001
}
fn default_orchestrator_name() -> String {
    "Orchestrator".to_string()
}
fn default_strategy() -> StrategyKind {
    StrategyKind::RoundRobin
}
fn default_max_iterations() -> u32 {
    3
}
fn default_response_timeout() -> u64 {
    300
}
fn default_orchestrator_port() -> u16 {
    8004
}
