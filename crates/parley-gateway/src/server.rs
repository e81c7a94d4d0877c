//! Axum surface for the relay: streaming chat, cooperative stop,
//! conversation history, and liveness, backed by the turn orchestrator.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use parley_ai::ChatClient;
use parley_core::current_unix_timestamp_ms;
use parley_relay::{
    CancellationToken, ChannelRelaySink, ClientFrame, ConversationStore, ToolRegistry, TurnConfig,
    TurnOrchestrator,
};
use parley_session::validate_conversation_id;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::types::{client_frame_event, ChatStopRequest, ChatStreamRequest, GatewayApiError};

pub(crate) const CHAT_STREAM_ENDPOINT: &str = "/v1/chat/stream";
pub(crate) const CHAT_STOP_ENDPOINT: &str = "/v1/chat/stop";
pub(crate) const CONVERSATION_DETAIL_ENDPOINT: &str = "/v1/conversations/{conversation_id}";
pub(crate) const STATUS_ENDPOINT: &str = "/v1/status";
pub(crate) const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Sink frames buffered between the turn task and the SSE body before
/// `emit` starts exerting backpressure on the upstream read loop.
const CLIENT_FRAME_CHANNEL_CAPACITY: usize = 64;

/// Public struct `GatewayServerConfig` used across Parley components.
#[derive(Clone)]
pub struct GatewayServerConfig {
    pub client: Arc<dyn ChatClient>,
    pub registry: Arc<ToolRegistry>,
    pub store: Arc<dyn ConversationStore>,
    pub turn: TurnConfig,
    pub state_dir: PathBuf,
    pub bind: String,
}

pub(crate) struct GatewayServerState {
    pub(crate) config: GatewayServerConfig,
    live_turns: Mutex<HashMap<String, CancellationToken>>,
    conversation_sequence: AtomicU64,
}

impl GatewayServerState {
    pub(crate) fn new(config: GatewayServerConfig) -> Self {
        Self {
            config,
            live_turns: Mutex::new(HashMap::new()),
            conversation_sequence: AtomicU64::new(0),
        }
    }

    fn next_conversation_id(&self) -> String {
        let sequence = self.conversation_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conv-{}-{sequence}", current_unix_timestamp_ms())
    }

    /// Claims the conversation for a new turn. Returns false when a turn is
    /// already in flight for the id.
    fn register_live_turn(&self, conversation_id: &str, token: CancellationToken) -> bool {
        let Ok(mut turns) = self.live_turns.lock() else {
            return false;
        };
        match turns.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    fn cancel_live_turn(&self, conversation_id: &str) -> bool {
        let Ok(turns) = self.live_turns.lock() else {
            return false;
        };
        match turns.get(conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn release_live_turn(&self, conversation_id: &str) {
        if let Ok(mut turns) = self.live_turns.lock() {
            turns.remove(conversation_id);
        }
    }

    fn live_turn_count(&self) -> usize {
        self.live_turns.lock().map(|turns| turns.len()).unwrap_or(0)
    }
}

/// Binds the configured address and serves the gateway until ctrl-c.
pub async fn run_gateway_server(config: GatewayServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;

    println!(
        "gateway server listening: addr={} model={} state_dir={}",
        local_addr,
        config.turn.model,
        config.state_dir.display()
    );

    let state = Arc::new(GatewayServerState::new(config));
    let app = build_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server exited unexpectedly")?;

    Ok(())
}

pub(crate) fn build_gateway_router(state: Arc<GatewayServerState>) -> Router {
    Router::new()
        .route(CHAT_STREAM_ENDPOINT, post(handle_chat_stream))
        .route(CHAT_STOP_ENDPOINT, post(handle_chat_stop))
        .route(CONVERSATION_DETAIL_ENDPOINT, get(handle_conversation_detail))
        .route(STATUS_ENDPOINT, get(handle_status))
        .with_state(state)
}

fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        GatewayApiError::bad_request(
            "malformed_json",
            format!("failed to parse request body: {error}"),
        )
    })
}

async fn handle_chat_stream(
    State(state): State<Arc<GatewayServerState>>,
    body: Bytes,
) -> Response {
    let request = match parse_json_body::<ChatStreamRequest>(&body) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };
    if request.message.trim().is_empty() {
        return GatewayApiError::bad_request("empty_message", "message must not be blank")
            .into_response();
    }

    let conversation_id = match request.conversation_id {
        Some(id) => {
            if let Err(error) = validate_conversation_id(&id) {
                return GatewayApiError::bad_request("invalid_conversation_id", error.to_string())
                    .into_response();
            }
            id
        }
        None => state.next_conversation_id(),
    };

    let token = CancellationToken::new();
    if !state.register_live_turn(&conversation_id, token.clone()) {
        return GatewayApiError::conflict(
            "turn_already_running",
            format!("conversation {conversation_id} already has a turn in flight"),
        )
        .into_response();
    }

    let (sender, receiver) = mpsc::channel::<ClientFrame>(CLIENT_FRAME_CHANNEL_CAPACITY);
    let mut orchestrator = TurnOrchestrator::new(
        Arc::clone(&state.config.client),
        Arc::clone(&state.config.registry),
        Arc::clone(&state.config.store),
        Arc::new(ChannelRelaySink::new(sender)),
        state.config.turn.clone(),
    )
    .with_cancellation(token);
    orchestrator.add_event_handler(Arc::new(|event| debug!(?event, "turn event")));

    let task_state = Arc::clone(&state);
    let task_conversation = conversation_id.clone();
    let message = request.message;
    tokio::spawn(async move {
        let report = orchestrator.run_turn(&task_conversation, &message).await;
        debug!(
            conversation = %task_conversation,
            status = ?report.status,
            tool_calls = report.tool_calls_dispatched,
            "turn task finished"
        );
        task_state.release_live_turn(&task_conversation);
    });

    let stream =
        ReceiverStream::new(receiver).map(|frame| Ok::<Event, Infallible>(client_frame_event(&frame)));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(header_value) = HeaderValue::from_str(&conversation_id) {
        response
            .headers_mut()
            .insert(CONVERSATION_ID_HEADER, header_value);
    }
    response
}

async fn handle_chat_stop(
    State(state): State<Arc<GatewayServerState>>,
    body: Bytes,
) -> Response {
    let request = match parse_json_body::<ChatStopRequest>(&body) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };

    if state.cancel_live_turn(&request.conversation_id) {
        debug!(conversation = %request.conversation_id, "stop requested for live turn");
        (
            StatusCode::OK,
            Json(json!({
                "conversation_id": request.conversation_id,
                "stopped": true,
            })),
        )
            .into_response()
    } else {
        GatewayApiError::not_found(
            "turn_not_found",
            format!(
                "no turn in flight for conversation {}",
                request.conversation_id
            ),
        )
        .into_response()
    }
}

async fn handle_conversation_detail(
    State(state): State<Arc<GatewayServerState>>,
    AxumPath(conversation_id): AxumPath<String>,
) -> Response {
    if let Err(error) = validate_conversation_id(&conversation_id) {
        return GatewayApiError::bad_request("invalid_conversation_id", error.to_string())
            .into_response();
    }

    let turns = match state.config.store.read_history(&conversation_id).await {
        Ok(turns) => turns,
        Err(error) => {
            return GatewayApiError::internal(format!(
                "failed to read conversation {conversation_id}: {error}"
            ))
            .into_response();
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "conversation_id": conversation_id,
            "turn_count": turns.len(),
            "turns": turns,
        })),
    )
        .into_response()
}

async fn handle_status(State(state): State<Arc<GatewayServerState>>) -> Response {
    let tools = state
        .config
        .registry
        .definitions()
        .into_iter()
        .map(|definition| definition.name)
        .collect::<Vec<_>>();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "model": state.config.turn.model,
            "state_dir": state.config.state_dir.display().to_string(),
            "tools": tools,
            "live_turns": state.live_turn_count(),
            "endpoints": {
                "chat_stream": CHAT_STREAM_ENDPOINT,
                "chat_stop": CHAT_STOP_ENDPOINT,
                "conversation_detail": CONVERSATION_DETAIL_ENDPOINT,
                "status": STATUS_ENDPOINT,
            },
        })),
    )
        .into_response()
}
