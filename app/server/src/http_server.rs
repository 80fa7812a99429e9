//! HTTP server receiving chat messages from the web widget and the
//! messaging-channel bridges.

use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use voltio_search::chat::APOLOGY_TEXT;
use voltio_search::{Channel, SearchOrchestrator, Uuid};

const TURN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// New conversations may omit it; one is assigned and echoed back.
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    session_id: String,
    response: String,
    escalated: bool,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SearchOrchestrator>,
}

async fn handle_chat(
    AxumState(state): AxumState<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    if payload.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".to_string()));
    }

    let session_id = payload
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = payload.user_id.unwrap_or_else(|| session_id.clone());
    let channel = payload
        .channel
        .as_deref()
        .map(Channel::from_name)
        .unwrap_or_default();
    tracing::info!(session_id = %session_id, channel = ?channel, "Chat message received");

    // Dropping the turn future on timeout cancels every in-flight call and
    // commits nothing.
    let (response, escalated) = match tokio::time::timeout(
        TURN_TIMEOUT,
        state
            .orchestrator
            .handle_turn(&session_id, &user_id, channel, &payload.message),
    )
    .await
    {
        Ok(Ok(turn)) => (turn.text, turn.escalation.is_some()),
        Ok(Err(e)) => {
            tracing::error!(session_id = %session_id, error = %e, "Turn failed");
            (APOLOGY_TEXT.to_string(), false)
        }
        Err(_) => {
            tracing::warn!(session_id = %session_id, "Turn timed out after 60 seconds");
            (APOLOGY_TEXT.to_string(), false)
        }
    };

    Ok(Json(ChatResponse {
        session_id,
        response,
        escalated,
    }))
}

async fn health_check() -> &'static str {
    "Voltio search assistant is running"
}

pub async fn start_server(orchestrator: Arc<SearchOrchestrator>, addr: &str) -> anyhow::Result<()> {
    let app_state = AppState { orchestrator };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(health_check))
        .route("/chat", post(handle_chat))
        .layer(cors)
        .with_state(app_state);

    tracing::info!("Chat API listening on http://{}/chat", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
