//! Upstream chat protocol support: message model, stream decoding, delta
//! aggregation, and the OpenAI-compatible HTTP client.
mod openai;
mod sse;
mod stream;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig, DEFAULT_OPENAI_API_BASE};
pub use sse::{SseFrame, SseFrameDecoder};
pub use stream::{
    AssembledToolCall, ChatStreamChunk, ChatStreamDecoder, RawFrame, StreamAssembler,
    StreamChoice, StreamDelta, StreamFunctionDelta, StreamOutcome, StreamToolCallDelta,
    StreamUsage, MAX_TOOL_CALL_SLOTS, STREAM_DONE_SENTINEL,
};
pub use types::{
    ChatByteStream, ChatClient, ChatRequest, ChatResponse, ChatUsage, ContentBlock, Message,
    MessageRole, ParleyAiError, ToolCall, ToolChoice, ToolDefinition,
};
