//! Chat-completion stream decoding and delta aggregation.
//!
//! `ChatStreamDecoder` turns raw response bytes into discrete protocol
//! frames; `StreamAssembler` folds those frames into the assistant text
//! buffer and reassembles fragmented tool calls. Both are plain state
//! machines with no I/O so the caller controls pacing.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    sse::{SseFrame, SseFrameDecoder},
    ChatUsage,
};

/// Sentinel payload terminating a chat completion stream.
pub const STREAM_DONE_SENTINEL: &str = "[DONE]";

/// Upstream assigns tool-call slots sequentially from zero; an index far
/// beyond any plausible call count is a malformed fragment, and honoring
/// it would size the builder table to the attacker-chosen value.
pub const MAX_TOOL_CALL_SLOTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// One parsed stream chunk record.
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<StreamUsage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamChoice {
    pub delta: Option<StreamDelta>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// One tool-call fragment; `index` correlates fragments of concurrent calls.
pub struct StreamToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One decoded protocol event: a delta record or the stream-end sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Delta(ChatStreamChunk),
    Done,
}

/// Decodes arbitrarily-chunked response bytes into protocol frames.
///
/// Malformed data payloads are dropped and decoding continues; upstream
/// services interleave heartbeats and comment frames that are not chunk
/// records. After the sentinel no further frames are yielded, even when
/// more bytes follow.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder {
    framer: SseFrameDecoder,
    done: bool,
}

impl ChatStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the stream-end sentinel has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one chunk of response bytes, yielding every frame it completes.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        if self.done {
            return Vec::new();
        }
        let mut frames = Vec::new();
        for sse_frame in self.framer.push_chunk(chunk) {
            if self.done {
                break;
            }
            self.decode_frame(&sse_frame, &mut frames);
        }
        frames
    }

    /// Flushes trailing buffered bytes when the connection closes without a
    /// sentinel.
    pub fn finish(&mut self) -> Vec<RawFrame> {
        if self.done {
            return Vec::new();
        }
        let mut frames = Vec::new();
        if let Some(sse_frame) = self.framer.finish() {
            self.decode_frame(&sse_frame, &mut frames);
        }
        frames
    }

    fn decode_frame(&mut self, sse_frame: &SseFrame, out: &mut Vec<RawFrame>) {
        let data = sse_frame.data.trim();
        if data.is_empty() {
            return;
        }
        if data == STREAM_DONE_SENTINEL {
            self.done = true;
            out.push(RawFrame::Done);
            return;
        }
        match serde_json::from_str::<ChatStreamChunk>(data) {
            Ok(chunk) => out.push(RawFrame::Delta(chunk)),
            Err(error) => {
                let preview: String = data.chars().take(120).collect();
                debug!(error = %error, payload = %preview, "dropping malformed stream frame");
            }
        }
    }
}

/// Builder merging every fragment that shares one stream index.
///
/// `id` and `name` are set by the first non-empty value and never
/// overwritten; `arguments` is the ordered concatenation of every chunk.
#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallBuilder {
    fn merge(&mut self, fragment: &StreamToolCallDelta) {
        if let Some(id) = &fragment.id {
            if self.id.is_empty() && !id.is_empty() {
                self.id = id.clone();
            }
        }
        let Some(function) = &fragment.function else {
            return;
        };
        if let Some(name) = &function.name {
            if self.name.is_empty() && !name.is_empty() {
                self.name = name.clone();
            }
        }
        if let Some(arguments) = &function.arguments {
            self.arguments.push_str(arguments);
        }
    }
}

/// A tool call assembled from all fragments sharing an index. `arguments`
/// stays raw text here; validity is judged where the call is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Final state of one fully drained stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub content: String,
    pub tool_calls: Vec<AssembledToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<ChatUsage>,
}

/// Aggregates decoded frames: content deltas accumulate into the content
/// buffer and surface for relaying; tool-call fragments merge into
/// per-index builders and never surface mid-stream.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    builders: Vec<ToolCallBuilder>,
    arrival_order: Vec<usize>,
    finish_reason: Option<String>,
    usage: ChatUsage,
    saw_usage: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Applies one frame. Returns the content delta to relay when the frame
    /// carried text; tool-call frames return `None`.
    pub fn apply_frame(&mut self, frame: &RawFrame) -> Option<String> {
        let RawFrame::Delta(chunk) = frame else {
            return None;
        };

        if let Some(chunk_usage) = &chunk.usage {
            self.usage = ChatUsage {
                input_tokens: chunk_usage.prompt_tokens,
                output_tokens: chunk_usage.completion_tokens,
                total_tokens: chunk_usage.total_tokens,
            };
            self.saw_usage = true;
        }

        let mut relayed: Option<String> = None;
        for choice in &chunk.choices {
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }

            let Some(delta) = &choice.delta else {
                continue;
            };

            if let Some(delta_text) = &delta.content {
                if !delta_text.is_empty() {
                    self.content.push_str(delta_text);
                    match &mut relayed {
                        Some(text) => text.push_str(delta_text),
                        None => relayed = Some(delta_text.clone()),
                    }
                }
            }

            if let Some(fragments) = &delta.tool_calls {
                for fragment in fragments {
                    self.merge_fragment(fragment);
                }
            }
        }
        relayed
    }

    fn merge_fragment(&mut self, fragment: &StreamToolCallDelta) {
        let index = fragment.index;
        if index >= MAX_TOOL_CALL_SLOTS {
            debug!(index, "dropping tool-call fragment with out-of-range index");
            return;
        }
        if self.builders.len() <= index {
            self.builders.resize_with(index + 1, ToolCallBuilder::default);
        }
        if !self.arrival_order.contains(&index) {
            self.arrival_order.push(index);
        }
        self.builders[index].merge(fragment);
    }

    /// Freezes the stream. Assembled calls keep the order their index first
    /// appeared in; calls that never received a name are dropped.
    pub fn finish(self) -> StreamOutcome {
        let mut tool_calls = Vec::new();
        for index in &self.arrival_order {
            let builder = &self.builders[*index];
            if builder.name.trim().is_empty() {
                continue;
            }
            let id = if builder.id.trim().is_empty() {
                format!("stream_tool_call_{}", index + 1)
            } else {
                builder.id.clone()
            };
            tool_calls.push(AssembledToolCall {
                id,
                name: builder.name.clone(),
                arguments: builder.arguments.clone(),
            });
        }

        StreamOutcome {
            content: self.content,
            tool_calls,
            finish_reason: self.finish_reason,
            usage: self.saw_usage.then_some(self.usage),
        }
    }
}
