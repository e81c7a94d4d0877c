//! HTTP gateway for the Parley relay: axum routes exposing streaming chat
//! over SSE, cooperative stop, conversation history, and liveness.

mod quiz_tool;
mod server;
mod types;


pub use quiz_tool::{SaveQuizTool, SAVE_QUIZ_TOOL_NAME};
pub use server::{run_gateway_server, GatewayServerConfig};
