//! Wiring from `conclave.toml` to buses, stores and services.

use crate::config::{AgentEntry, ConclaveConfig, StateBackend, StateConfig, StrategyKind};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use conclave_agent::{Agent, LlmClient, ModelConfig};
use conclave_bus::{
    AgentRegistry, HttpMessageBus, InMemoryMessageBus, InMemoryStateStore, MessageBus,
    SqliteStateStore, StateStore,
};
use conclave_core::EventEnvelope;
use conclave_orchestrator::{
    LlmStrategy, Orchestrator, RandomStrategy, RoundRobinStrategy, SpeakerStrategy, WorkflowStore,
};
use conclave_service::AgentService;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Bus and shared stores of one process.
pub struct Runtime {
    pub bus: Arc<dyn MessageBus>,
    pub registry: AgentRegistry,
    pub workflows: WorkflowStore,
    distributed: bool,
}

impl Runtime {
    /// Builds the bus and stores `config` describes. Peers turn the bus into
    /// an HTTP bus spanning processes.
    pub async fn connect(config: &ConclaveConfig) -> anyhow::Result<Self> {
        let local = Arc::new(InMemoryMessageBus::new(
            config.bus.name.clone(),
            config.bus.capacity,
        ));
        let distributed = !config.bus.peers.is_empty();
        let bus: Arc<dyn MessageBus> = if distributed {
            let mut bus = HttpMessageBus::new(local, HashMap::new());
            for (topic, urls) in &config.bus.peers {
                for url in urls.urls() {
                    bus = bus.with_peer(topic.clone(), url);
                }
            }
            info!(topics = config.bus.peers.len(), "HTTP message bus configured");
            Arc::new(bus)
        } else {
            local
        };

        let registry_store = open_store(&config.state, &config.state.registry_store).await?;
        let workflow_store = open_store(&config.state, &config.state.workflow_store).await?;
        Ok(Self {
            bus,
            registry: AgentRegistry::new(registry_store, config.state.registry_key.clone()),
            workflows: WorkflowStore::new(workflow_store, config.state.workflow_key.clone()),
            distributed,
        })
    }

    /// Everything in this process: in-memory bus and stores, no peers.
    pub fn in_process(config: &ConclaveConfig) -> Self {
        let state = &config.state;
        Self {
            bus: Arc::new(InMemoryMessageBus::new(
                config.bus.name.clone(),
                config.bus.capacity,
            )),
            registry: AgentRegistry::new(
                Arc::new(InMemoryStateStore::new(state.registry_store.clone())),
                state.registry_key.clone(),
            ),
            workflows: WorkflowStore::new(
                Arc::new(InMemoryStateStore::new(state.workflow_store.clone())),
                state.workflow_key.clone(),
            ),
            distributed: false,
        }
    }

    /// Whether results arrive over HTTP rather than in-process.
    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn agent_service(
        &self,
        entry: &AgentEntry,
        config: &ConclaveConfig,
        port: Option<u16>,
    ) -> anyhow::Result<Arc<AgentService>> {
        let model = entry.model.clone().unwrap_or_else(|| config.model.clone());
        let agent = Agent::new(entry.agent.clone(), llm_client(model)?);
        let mut service_config = entry.service_config(&config.bus);
        if let Some(port) = port {
            service_config.port = port;
        }
        Ok(Arc::new(AgentService::new(
            Arc::new(agent),
            self.bus.clone(),
            self.registry.clone(),
            service_config,
        )))
    }

    pub fn orchestrator(
        &self,
        config: &ConclaveConfig,
        max_iterations: Option<u32>,
    ) -> anyhow::Result<Orchestrator<Box<dyn SpeakerStrategy>>> {
        let mut engine = config.orchestrator.engine_config(&config.bus);
        if let Some(max) = max_iterations {
            anyhow::ensure!(max > 0, "--max-iterations must be at least 1");
            engine.max_iterations = max;
        }
        let strategy = strategy(config.orchestrator.kind, &config.model)?;
        Ok(Orchestrator::new(
            engine,
            strategy,
            self.bus.clone(),
            self.registry.clone(),
            self.workflows.clone(),
        ))
    }
}

async fn open_store(state: &StateConfig, name: &str) -> anyhow::Result<Arc<dyn StateStore>> {
    Ok(match state.backend {
        StateBackend::Memory => Arc::new(InMemoryStateStore::new(name)),
        StateBackend::Sqlite => Arc::new(SqliteStateStore::new(state.dir.clone(), name).await?),
    })
}

fn llm_client(model: ModelConfig) -> anyhow::Result<LlmClient> {
    Ok(LlmClient::new(model.resolve_api_key()?)?)
}

pub fn strategy(kind: StrategyKind, model: &ModelConfig) -> anyhow::Result<Box<dyn SpeakerStrategy>> {
    Ok(match kind {
        StrategyKind::Random => Box::new(RandomStrategy::new()),
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::Llm => Box::new(LlmStrategy::new(llm_client(model.clone())?)),
    })
}

/// Inbound side of a process that only consumes events, such as an
/// orchestrator waiting for task results from remote agents.
pub fn inbound_router(bus: Arc<dyn MessageBus>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/events/{pubsub}/{topic}", post(event_handler))
        .with_state(bus)
}

async fn health_handler(State(bus): State<Arc<dyn MessageBus>>) -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "bus": bus.name()}))
}

async fn event_handler(
    Path((pubsub, topic)): Path<(String, String)>,
    State(bus): State<Arc<dyn MessageBus>>,
    Json(envelope): Json<EventEnvelope>,
) -> impl IntoResponse {
    if envelope.pubsub_name != pubsub || envelope.topic != topic || pubsub != bus.name() {
        warn!(pubsub = %pubsub, topic = %topic, event_id = %envelope.id, "Dropping misaddressed event");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "DROP"})),
        );
    }
    match bus.deliver_local(envelope).await {
        Ok(delivered) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "SUCCESS", "delivered": delivered})),
        ),
        Err(e) => {
            warn!(error = %e, "Failed to deliver inbound event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "RETRY", "error": e.to_string()})),
            )
        }
    }
}
