//! Streaming turn orchestration: relays upstream chat deltas to a client
//! sink, dispatches model-requested tool calls, and persists each finished
//! exchange through a conversation store.
mod cancellation;
mod events;
mod orchestrator;
mod registry;
mod sink;
mod store;

pub use cancellation::CancellationToken;
pub use events::{TurnEvent, TurnEventHandler};
pub use orchestrator::{
    TurnConfig, TurnError, TurnOrchestrator, TurnReport, TurnStatus, TOOL_FAILURE_APOLOGY,
    TURN_FAILURE_APOLOGY,
};
pub use registry::{ToolHandler, ToolOutcome, ToolRegistry};
pub use sink::{ChannelRelaySink, ClientFrame, RelaySink, SinkError};
pub use store::{
    history_messages, ConversationStore, NewTurn, StoreError, TurnOutcomeMarker, TurnRecord,
};
