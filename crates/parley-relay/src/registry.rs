use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parley_ai::{AssembledToolCall, ToolDefinition};
use parley_core::truncate_chars;
use serde_json::{json, Value};
use tracing::debug;

/// Result returned by a tool handler: a structured payload recorded in the
/// conversation, plus a short human-readable line relayed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub payload: Value,
    pub user_message: String,
    pub is_error: bool,
}

impl ToolOutcome {
    /// Creates a successful tool outcome.
    pub fn ok(payload: Value, user_message: impl Into<String>) -> Self {
        Self {
            payload,
            user_message: user_message.into(),
            is_error: false,
        }
    }

    /// Creates a failed tool outcome.
    pub fn error(payload: Value, user_message: impl Into<String>) -> Self {
        Self {
            payload,
            user_message: user_message.into(),
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool turn.
    pub fn as_text(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Trait contract for `ToolHandler` behavior.
///
/// Handlers receive parsed arguments and report failure through the
/// returned outcome; they are never invoked with arguments that failed
/// validation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value) -> ToolOutcome;
}

/// Registry mapping tool names to handlers. Registered once at startup and
/// shared read-only across concurrent turns.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler under its definition name. Re-registering a name
    /// replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        self.tools.insert(name, handler);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions of every registered tool, name-sorted so upstream
    /// request bodies are deterministic.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|handler| handler.definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Runs one assembled tool call to an outcome. Unknown names, invalid
    /// arguments, handler panics, and timeouts all come back as error
    /// outcomes; dispatch itself never fails.
    pub async fn dispatch(
        &self,
        call: &AssembledToolCall,
        tool_timeout: Option<Duration>,
    ) -> ToolOutcome {
        let Some(handler) = self.tools.get(&call.name) else {
            return ToolOutcome::error(
                json!({ "error": format!("tool '{}' is not registered", call.name) }),
                format!("The requested tool '{}' is not available.", call.name),
            );
        };

        let arguments = match parse_tool_arguments(&call.arguments) {
            Ok(value) => value,
            Err(reason) => {
                return ToolOutcome::error(
                    json!({ "error": format!("invalid arguments for '{}': {reason}", call.name) }),
                    format!("The arguments for tool '{}' could not be read.", call.name),
                );
            }
        };

        debug!(
            tool = %call.name,
            arguments = %truncate_chars(&call.arguments, 200),
            "dispatching tool call"
        );

        let tool_name = call.name.clone();
        let handler = Arc::clone(handler);
        let execution = tokio::spawn(async move {
            if let Some(timeout) = tool_timeout {
                match tokio::time::timeout(timeout, handler.execute(arguments)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ToolOutcome::error(
                        json!({
                            "error": format!(
                                "tool '{}' timed out after {}ms",
                                tool_name,
                                timeout.as_millis()
                            )
                        }),
                        format!("Tool '{tool_name}' took too long and was stopped."),
                    ),
                }
            } else {
                handler.execute(arguments).await
            }
        });

        match execution.await {
            Ok(outcome) => outcome,
            Err(error) => ToolOutcome::error(
                json!({ "error": format!("tool '{}' execution task failed: {error}", call.name) }),
                format!("Tool '{}' failed unexpectedly.", call.name),
            ),
        }
    }
}

/// Arguments must parse as JSON and carry at least one field. Empty text
/// and the bare empty object both count as "no usable arguments".
fn parse_tool_arguments(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("arguments were empty".to_string());
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|error| error.to_string())?;
    if value.as_object().is_some_and(|object| object.is_empty()) {
        return Err("arguments carried no fields".to_string());
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingTool {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolHandler for CountingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.to_string(),
                description: "Counts invocations".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "title": { "type": "string" } }
                }),
            }
        }

        async fn execute(&self, arguments: Value) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutcome::ok(arguments, "Done.")
        }
    }

    struct StallingTool;

    #[async_trait]
    impl ToolHandler for StallingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "stall".to_string(),
                description: "Never finishes".to_string(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn execute(&self, _arguments: Value) -> ToolOutcome {
            futures_util::future::pending().await
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl ToolHandler for PanickingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "panic".to_string(),
                description: "Panics on execute".to_string(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn execute(&self, _arguments: Value) -> ToolOutcome {
            panic!("handler blew up");
        }
    }

    fn call(name: &str, arguments: &str) -> AssembledToolCall {
        AssembledToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            name: "save_quiz",
            calls,
        }));
        registry
    }

    #[tokio::test]
    async fn functional_dispatch_runs_handler_with_parsed_arguments() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&calls));

        let outcome = registry
            .dispatch(&call("save_quiz", "{\"title\":\"T\"}"), None)
            .await;

        assert!(!outcome.is_error);
        assert_eq!(outcome.payload, json!({"title": "T"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn functional_unknown_tool_returns_error_without_side_effects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&calls));

        let outcome = registry
            .dispatch(&call("unknown_tool", "{\"title\":\"T\"}"), None)
            .await;

        assert!(outcome.is_error);
        assert!(outcome.user_message.contains("unknown_tool"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn regression_unparseable_arguments_never_reach_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&calls));

        for bad in ["", "   ", "{\"title\":", "{}", "{ }"] {
            let outcome = registry.dispatch(&call("save_quiz", bad), None).await;
            assert!(outcome.is_error, "arguments {bad:?} must be rejected");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unit_non_object_json_arguments_are_accepted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&calls));

        let outcome = registry.dispatch(&call("save_quiz", "[1,2]"), None).await;
        assert!(!outcome.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn functional_handler_timeout_becomes_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StallingTool));

        let outcome = registry
            .dispatch(
                &call("stall", "{\"x\":1}"),
                Some(Duration::from_millis(20)),
            )
            .await;

        assert!(outcome.is_error);
        assert!(outcome.as_text().contains("timed out"));
    }

    #[tokio::test]
    async fn regression_handler_panic_is_contained_as_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(PanickingTool));

        let outcome = registry.dispatch(&call("panic", "{\"x\":1}"), None).await;
        assert!(outcome.is_error);
        assert!(outcome.as_text().contains("execution task failed"));
    }

    #[tokio::test]
    async fn unit_reregistering_a_name_replaces_the_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            name: "save_quiz",
            calls: Arc::clone(&first),
        }));
        registry.register(Arc::new(CountingTool {
            name: "save_quiz",
            calls: Arc::clone(&second),
        }));

        assert_eq!(registry.definitions().len(), 1);

        let outcome = registry
            .dispatch(&call("save_quiz", "{\"title\":\"T\"}"), None)
            .await;

        assert!(!outcome.is_error);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unit_definitions_are_name_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            name: "zeta",
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        registry.register(Arc::new(CountingTool {
            name: "alpha",
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|definition| definition.name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
