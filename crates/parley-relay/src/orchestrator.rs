use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use parley_ai::{
    AssembledToolCall, ChatClient, ChatRequest, ChatStreamDecoder, ChatUsage, ContentBlock,
    Message, RawFrame, StreamAssembler, StreamOutcome, ToolChoice, ToolDefinition,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    cancellation::CancellationToken,
    events::{emit_event, TurnEvent, TurnEventHandler},
    registry::ToolRegistry,
    sink::RelaySink,
    store::{history_messages, ConversationStore, NewTurn, StoreError, TurnOutcomeMarker, TurnRecord},
};

/// Fixed apology relayed when a turn aborts on an unrecoverable error.
pub const TURN_FAILURE_APOLOGY: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

/// Fixed apology relayed for a tool call that could not be completed.
pub const TOOL_FAILURE_APOLOGY: &str =
    "Sorry, one of the requested actions could not be completed.";

const DEFAULT_TOOL_CONFIRMATION: &str = "The requested action completed.";

/// Public struct `TurnConfig` used across Parley components.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream_read_timeout_ms: u64,
    pub tool_timeout_ms: Option<u64>,
    pub history_limit: Option<usize>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            stream_read_timeout_ms: 30_000,
            tool_timeout_ms: Some(120_000),
            history_limit: None,
        }
    }
}

/// Terminal classification of one client-facing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
/// Enumerates supported `TurnError` values.
pub enum TurnError {
    #[error(transparent)]
    Upstream(#[from] parley_ai::ParleyAiError),
    #[error("upstream read timed out after {timeout_ms}ms")]
    ReadTimeout { timeout_ms: u64 },
    #[error("client stream closed before the turn finished")]
    SinkClosed,
    #[error("turn stopped by caller")]
    Cancelled,
    #[error("conversation store failure: {0}")]
    Store(#[from] StoreError),
}

/// Summary of a finished exchange, for logging and transport callers.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub status: TurnStatus,
    pub content: String,
    pub tool_calls_dispatched: usize,
    pub tool_failures: usize,
    pub usage: Option<ChatUsage>,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct TurnScratch {
    buffer: String,
    user_turn_id: Option<u64>,
    dispatched: usize,
    tool_failures: usize,
    usage: Option<ChatUsage>,
    finish_reason: Option<String>,
}

impl TurnScratch {
    fn absorb(&mut self, outcome: &StreamOutcome) {
        if let Some(usage) = &outcome.usage {
            let total = self.usage.get_or_insert_with(ChatUsage::default);
            total.input_tokens = total.input_tokens.saturating_add(usage.input_tokens);
            total.output_tokens = total.output_tokens.saturating_add(usage.output_tokens);
            total.total_tokens = total.total_tokens.saturating_add(usage.total_tokens);
        }
        if outcome.finish_reason.is_some() {
            self.finish_reason.clone_from(&outcome.finish_reason);
        }
    }
}

/// Public struct `TurnOrchestrator` used across Parley components.
///
/// Drives one client-facing exchange end to end: primary upstream stream,
/// tool dispatch when the model requested it, an optional follow-up
/// stream, then persistence and the terminal client frame. Every terminal
/// path persists exactly one assistant turn and emits exactly one
/// finished frame.
pub struct TurnOrchestrator {
    client: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    sink: Arc<dyn RelaySink>,
    config: TurnConfig,
    cancellation: CancellationToken,
    handlers: Vec<TurnEventHandler>,
}

impl TurnOrchestrator {
    pub fn new(
        client: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
        sink: Arc<dyn RelaySink>,
        config: TurnConfig,
    ) -> Self {
        Self {
            client,
            registry,
            store,
            sink,
            config,
            cancellation: CancellationToken::new(),
            handlers: Vec::new(),
        }
    }

    /// Replaces the orchestrator's cancellation token so a transport layer
    /// can stop the turn from outside.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn add_event_handler(&mut self, handler: TurnEventHandler) {
        self.handlers.push(handler);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Runs one exchange for `conversation_id` seeded with `user_text`.
    ///
    /// Failures are absorbed into the protocol rather than returned: the
    /// client always receives a terminal frame and the store always
    /// receives the assistant turn, so the report is the only signal the
    /// caller needs.
    pub async fn run_turn(&self, conversation_id: &str, user_text: &str) -> TurnReport {
        self.emit(TurnEvent::TurnStart {
            conversation_id: conversation_id.to_string(),
        });

        let mut scratch = TurnScratch::default();
        let result = self
            .run_exchange(conversation_id, user_text, &mut scratch)
            .await;

        let (status, marker, error) = match &result {
            Ok(()) => (TurnStatus::Completed, TurnOutcomeMarker::Completed, None),
            Err(TurnError::Cancelled) => {
                debug!(conversation = conversation_id, "turn stopped by caller");
                (TurnStatus::Stopped, TurnOutcomeMarker::StoppedByCaller, None)
            }
            Err(TurnError::SinkClosed) => {
                debug!(conversation = conversation_id, "client disconnected mid turn");
                (TurnStatus::Stopped, TurnOutcomeMarker::StoppedByCaller, None)
            }
            Err(turn_error) => {
                warn!(conversation = conversation_id, error = %turn_error, "turn failed");
                (
                    TurnStatus::Failed,
                    TurnOutcomeMarker::Failed,
                    Some(turn_error.to_string()),
                )
            }
        };

        if status == TurnStatus::Failed {
            let rendered = push_fragment(&mut scratch.buffer, TURN_FAILURE_APOLOGY);
            if self.sink.emit_error(&rendered).await.is_err() {
                debug!(
                    conversation = conversation_id,
                    "client stream closed before the apology frame"
                );
            }
        }

        self.finalize(conversation_id, &scratch, marker).await;

        self.emit(TurnEvent::TurnEnd {
            conversation_id: conversation_id.to_string(),
            status,
            relayed_chars: scratch.buffer.chars().count(),
            tool_calls_dispatched: scratch.dispatched,
        });

        TurnReport {
            status,
            content: scratch.buffer,
            tool_calls_dispatched: scratch.dispatched,
            tool_failures: scratch.tool_failures,
            usage: scratch.usage,
            finish_reason: scratch.finish_reason,
            error,
        }
    }

    async fn run_exchange(
        &self,
        conversation_id: &str,
        user_text: &str,
        scratch: &mut TurnScratch,
    ) -> Result<(), TurnError> {
        if self.cancellation.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let history = self.store.read_history(conversation_id).await?;
        let mut messages = Vec::new();
        if !self.config.system_prompt.trim().is_empty() {
            messages.push(Message::system(self.config.system_prompt.clone()));
        }
        messages.extend(history_messages(bounded_history(
            &history,
            self.config.history_limit,
        )));
        messages.push(Message::user(user_text));

        let user_turn = self
            .store
            .append_turn(conversation_id, NewTurn::user(user_text))
            .await?;
        scratch.user_turn_id = Some(user_turn.id);
        self.store
            .mark_streaming(conversation_id, user_turn.id, true)
            .await?;

        let tools = self.registry.definitions();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some(ToolChoice::Auto)
        };
        let request = self.build_request(messages.clone(), tools.clone(), tool_choice);

        self.emit(TurnEvent::StreamOpened { follow_up: false });
        let outcome = self
            .drive_streaming_turn(request, &mut scratch.buffer, false)
            .await?;
        scratch.absorb(&outcome);

        if outcome.tool_calls.is_empty() {
            return Ok(());
        }

        let successes = self
            .dispatch_tool_calls(&outcome.tool_calls, &mut messages, scratch)
            .await?;
        if successes == 0 {
            return Ok(());
        }

        // The follow-up presents the tool results; letting the model queue
        // more calls here would chain turns without bound.
        let follow_up = self.build_request(messages, tools, Some(ToolChoice::None));
        self.emit(TurnEvent::StreamOpened { follow_up: true });
        let follow_outcome = self
            .drive_streaming_turn(follow_up, &mut scratch.buffer, true)
            .await?;
        scratch.absorb(&follow_outcome);
        if !follow_outcome.tool_calls.is_empty() {
            debug!(
                count = follow_outcome.tool_calls.len(),
                "ignoring tool calls issued by the follow-up turn"
            );
        }

        Ok(())
    }

    fn build_request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        tool_choice: Option<ToolChoice>,
    ) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages,
            tools,
            tool_choice,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Opens one upstream stream and drains it through the decoder and
    /// aggregator, relaying every content delta as it arrives. Appends
    /// relayed text to `buffer` before emitting so the persisted content
    /// never trails what the client was sent. With `separate_from_buffer`
    /// set, the first relayed delta is prefixed with a paragraph break so
    /// follow-up text does not run into earlier fragments.
    async fn drive_streaming_turn(
        &self,
        request: ChatRequest,
        buffer: &mut String,
        separate_from_buffer: bool,
    ) -> Result<StreamOutcome, TurnError> {
        let timeout_ms = self.config.stream_read_timeout_ms.max(1);
        let read_timeout = Duration::from_millis(timeout_ms);
        let mut needs_separator = separate_from_buffer && !buffer.is_empty();

        let mut stream = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Err(TurnError::Cancelled),
            opened = tokio::time::timeout(read_timeout, self.client.open_stream(request)) => match opened {
                Ok(result) => result?,
                Err(_) => return Err(TurnError::ReadTimeout { timeout_ms }),
            },
        };

        let mut decoder = ChatStreamDecoder::new();
        let mut assembler = StreamAssembler::new();

        while !decoder.is_done() {
            let next_chunk = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => return Err(TurnError::Cancelled),
                read = tokio::time::timeout(read_timeout, stream.next()) => match read {
                    Ok(chunk) => chunk,
                    Err(_) => return Err(TurnError::ReadTimeout { timeout_ms }),
                },
            };

            let Some(chunk) = next_chunk else {
                break;
            };
            let chunk = chunk?;
            for frame in decoder.push_chunk(&chunk) {
                self.relay_frame(&frame, &mut assembler, buffer, &mut needs_separator)
                    .await?;
            }
        }

        for frame in decoder.finish() {
            self.relay_frame(&frame, &mut assembler, buffer, &mut needs_separator)
                .await?;
        }

        Ok(assembler.finish())
    }

    async fn relay_frame(
        &self,
        frame: &RawFrame,
        assembler: &mut StreamAssembler,
        buffer: &mut String,
        needs_separator: &mut bool,
    ) -> Result<(), TurnError> {
        if let Some(delta) = assembler.apply_frame(frame) {
            let rendered = if *needs_separator {
                *needs_separator = false;
                format!("\n\n{delta}")
            } else {
                delta
            };
            buffer.push_str(&rendered);
            self.sink
                .emit_content(&rendered)
                .await
                .map_err(|_| TurnError::SinkClosed)?;
        }
        Ok(())
    }

    async fn dispatch_tool_calls(
        &self,
        calls: &[AssembledToolCall],
        messages: &mut Vec<Message>,
        scratch: &mut TurnScratch,
    ) -> Result<usize, TurnError> {
        let tool_timeout = self
            .config
            .tool_timeout_ms
            .filter(|timeout_ms| *timeout_ms > 0)
            .map(Duration::from_millis);
        let mut successes = 0usize;

        for call in calls {
            if self.cancellation.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            self.emit(TurnEvent::ToolDispatchStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            });
            let outcome = self.registry.dispatch(call, tool_timeout).await;
            scratch.dispatched = scratch.dispatched.saturating_add(1);
            if outcome.is_error {
                scratch.tool_failures = scratch.tool_failures.saturating_add(1);
            } else {
                successes = successes.saturating_add(1);
            }
            self.emit(TurnEvent::ToolDispatchEnd {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                is_error: outcome.is_error,
            });

            messages.push(Message::assistant_blocks(vec![ContentBlock::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: tool_call_argument_value(&call.arguments),
            }]));
            messages.push(Message::tool_result(
                call.id.clone(),
                call.name.clone(),
                outcome.as_text(),
                outcome.is_error,
            ));

            if outcome.is_error {
                let rendered = push_fragment(&mut scratch.buffer, TOOL_FAILURE_APOLOGY);
                self.sink
                    .emit_error(&rendered)
                    .await
                    .map_err(|_| TurnError::SinkClosed)?;
            } else {
                let confirmation = if outcome.user_message.trim().is_empty() {
                    DEFAULT_TOOL_CONFIRMATION
                } else {
                    outcome.user_message.as_str()
                };
                let rendered = push_fragment(&mut scratch.buffer, confirmation);
                self.sink
                    .emit_content(&rendered)
                    .await
                    .map_err(|_| TurnError::SinkClosed)?;
            }
        }

        Ok(successes)
    }

    /// Terminal bookkeeping shared by every path: persist the assistant
    /// turn, clear the streaming marker, send the finished frame. Store
    /// failures are logged rather than propagated so the client still
    /// gets its terminal signal.
    async fn finalize(
        &self,
        conversation_id: &str,
        scratch: &TurnScratch,
        marker: TurnOutcomeMarker,
    ) {
        let turn = NewTurn::assistant(scratch.buffer.clone(), marker);
        if let Err(store_error) = self.store.append_turn(conversation_id, turn).await {
            error!(
                conversation = conversation_id,
                error = %store_error,
                "failed to persist assistant turn"
            );
        }

        if let Some(user_turn_id) = scratch.user_turn_id {
            if let Err(store_error) = self
                .store
                .mark_streaming(conversation_id, user_turn_id, false)
                .await
            {
                warn!(
                    conversation = conversation_id,
                    error = %store_error,
                    "failed to clear streaming marker"
                );
            }
        }

        if self.sink.emit_finished().await.is_err() {
            debug!(
                conversation = conversation_id,
                "client stream closed before terminal frame"
            );
        }
    }

    fn emit(&self, event: TurnEvent) {
        emit_event(&self.handlers, &event);
    }
}

fn bounded_history(records: &[TurnRecord], limit: Option<usize>) -> &[TurnRecord] {
    match limit {
        Some(limit) if records.len() > limit => &records[records.len() - limit..],
        _ => records,
    }
}

/// Appends a standalone fragment to the buffer, separated from earlier
/// text, returning exactly the text appended so the relayed frame and the
/// persisted content stay equal.
fn push_fragment(buffer: &mut String, fragment: &str) -> String {
    let rendered = if buffer.is_empty() {
        fragment.to_string()
    } else {
        format!("\n\n{fragment}")
    };
    buffer.push_str(&rendered);
    rendered
}

fn tool_call_argument_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}
