use std::sync::Arc;

use crate::orchestrator::TurnStatus;

/// Enumerates supported `TurnEvent` values.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TurnStart {
        conversation_id: String,
    },
    StreamOpened {
        follow_up: bool,
    },
    ToolDispatchStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolDispatchEnd {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
    TurnEnd {
        conversation_id: String,
        status: TurnStatus,
        relayed_chars: usize,
        tool_calls_dispatched: usize,
    },
}

/// Observer invoked synchronously at turn lifecycle points.
pub type TurnEventHandler = Arc<dyn Fn(&TurnEvent) + Send + Sync>;

/// A panicking observer must not take the turn down with it.
pub(crate) fn emit_event(handlers: &[TurnEventHandler], event: &TurnEvent) {
    for handler in handlers {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
    }
}
