use crate::service::AgentService;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use conclave_core::{ConclaveError, ConclaveResult, EventEnvelope};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Body of `POST /InvokeTask`.
#[derive(Debug, Default, Deserialize)]
pub struct InvokeTaskRequest {
    /// Task to run. `None` lets the agent act on its memory.
    #[serde(default)]
    pub task: Option<String>,
}

/// HTTP surface of an agent service.
pub fn router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/GetMessages", get(get_messages_handler))
        .route("/InvokeTask", post(invoke_task_handler))
        .route("/events/{pubsub}/{topic}", post(event_handler))
        .route("/subscribe", get(subscribe_handler))
        .with_state(service)
}

/// Serves `router(service)` on `listener` until `shutdown` resolves.
pub async fn serve(
    service: Arc<AgentService>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ConclaveResult<()> {
    let addr = listener.local_addr()?;
    info!(agent = %service.name(), addr = %addr, "HTTP server listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Binds `host:port` from the service config and serves until `shutdown`.
pub async fn bind_and_serve(
    service: Arc<AgentService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> ConclaveResult<()> {
    let addr = format!("{}:{}", service.config().host, service.config().port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        ConclaveError::Config(format!("failed to bind {addr}: {e}"))
    })?;
    serve(service, listener, shutdown).await
}

async fn health_handler(State(service): State<Arc<AgentService>>) -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": service.name()}))
}

async fn get_messages_handler(State(service): State<Arc<AgentService>>) -> impl IntoResponse {
    Json(service.get_messages())
}

async fn invoke_task_handler(
    State(service): State<Arc<AgentService>>,
    Json(request): Json<InvokeTaskRequest>,
) -> impl IntoResponse {
    match service.invoke_task(request.task.as_deref()).await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::json!({"response": response})),
        ),
        Err(e) => {
            warn!(agent = %service.name(), error = %e, "InvokeTask failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

async fn event_handler(
    Path((pubsub, topic)): Path<(String, String)>,
    State(service): State<Arc<AgentService>>,
    Json(envelope): Json<EventEnvelope>,
) -> impl IntoResponse {
    if envelope.pubsub_name != pubsub || envelope.topic != topic {
        warn!(
            pubsub = %pubsub,
            topic = %topic,
            event_id = %envelope.id,
            "Event address does not match route"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "DROP", "error": "event address does not match route"})),
        );
    }
    match service.receive_event(envelope).await {
        Ok(delivered) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "SUCCESS", "delivered": delivered})),
        ),
        Err(e) => {
            warn!(agent = %service.name(), error = %e, "Rejected inbound event");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"status": "DROP", "error": e.to_string()})),
            )
        }
    }
}

async fn subscribe_handler(State(service): State<Arc<AgentService>>) -> impl IntoResponse {
    Json(service.subscriptions_json())
}
