use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One client-visible relay event. A session carries any number of content
/// frames followed by exactly one frame with `finished` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub content: String,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

impl ClientFrame {
    /// A content delta frame.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            finished: false,
            error: None,
        }
    }

    /// A content frame flagged as an error notice.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            finished: false,
            error: Some(true),
        }
    }

    /// The terminal frame closing a client session.
    pub fn finished() -> Self {
        Self {
            content: String::new(),
            finished: true,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `SinkError` values.
pub enum SinkError {
    #[error("client stream closed")]
    Closed,
}

/// Trait contract for `RelaySink` behavior.
///
/// `emit` must deliver frames in call order and block (or fail) under
/// backpressure instead of dropping data; the caller pauses upstream
/// consumption while an emit is in flight.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn emit(&self, frame: ClientFrame) -> Result<(), SinkError>;

    async fn emit_content(&self, text: &str) -> Result<(), SinkError> {
        self.emit(ClientFrame::content(text)).await
    }

    async fn emit_error(&self, text: &str) -> Result<(), SinkError> {
        self.emit(ClientFrame::error(text)).await
    }

    async fn emit_finished(&self) -> Result<(), SinkError> {
        self.emit(ClientFrame::finished()).await
    }
}

/// Sink backed by a bounded channel; the transport side drains the receiver
/// into its client connection. A full channel makes `emit` wait, which is
/// the backpressure signal that pauses the upstream read loop.
#[derive(Debug, Clone)]
pub struct ChannelRelaySink {
    sender: tokio::sync::mpsc::Sender<ClientFrame>,
}

impl ChannelRelaySink {
    pub fn new(sender: tokio::sync::mpsc::Sender<ClientFrame>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl RelaySink for ChannelRelaySink {
    async fn emit(&self, frame: ClientFrame) -> Result<(), SinkError> {
        self.sender.send(frame).await.map_err(|_| SinkError::Closed)
    }
}
