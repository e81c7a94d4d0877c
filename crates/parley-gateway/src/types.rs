//! Request bodies and the JSON error envelope shared by every endpoint.

use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parley_relay::ClientFrame;
use serde::Deserialize;
use serde_json::json;

/// Error payload mapped to the `{"error": {code, message}}` HTTP envelope.
#[derive(Debug)]
pub(crate) struct GatewayApiError {
    pub(crate) status: StatusCode,
    pub(crate) code: &'static str,
    pub(crate) message: String,
}

impl GatewayApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub(crate) fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

/// Body of `POST /v1/chat/stream`.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatStreamRequest {
    #[serde(default)]
    pub(crate) conversation_id: Option<String>,
    pub(crate) message: String,
}

/// Body of `POST /v1/chat/stop`.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatStopRequest {
    pub(crate) conversation_id: String,
}

/// Renders one relay frame as the data payload of a server-sent event.
pub(crate) fn client_frame_event(frame: &ClientFrame) -> Event {
    let mut payload = json!({
        "content": frame.content,
        "finished": frame.finished,
    });
    if let Some(error) = frame.error {
        payload["error"] = json!(error);
    }
    Event::default().data(payload.to_string())
}
