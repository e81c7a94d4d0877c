//! Sample `save_quiz` tool: persists a quiz document as a JSON file under
//! the gateway state directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parley_ai::ToolDefinition;
use parley_core::{current_unix_timestamp_ms, write_text_atomic};
use parley_relay::{ToolHandler, ToolOutcome};
use serde_json::{json, Value};
use tracing::debug;

pub const SAVE_QUIZ_TOOL_NAME: &str = "save_quiz";

/// Public struct `SaveQuizTool` used across Parley components.
pub struct SaveQuizTool {
    quiz_dir: PathBuf,
    sequence: AtomicU64,
}

impl SaveQuizTool {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            quiz_dir: state_dir.as_ref().join("quizzes"),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_file_name(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("quiz-{}-{sequence}.json", current_unix_timestamp_ms())
    }
}

#[async_trait]
impl ToolHandler for SaveQuizTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: SAVE_QUIZ_TOOL_NAME.to_string(),
            description:
                "Saves a generated quiz as a JSON document and returns its file name.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {
                        "type": "string",
                        "description": "Quiz title."
                    },
                    "questions": {
                        "type": "array",
                        "description": "Quiz questions in display order.",
                        "items": { "type": "object" }
                    }
                },
                "required": ["title", "questions"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolOutcome {
        let title = arguments
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if title.is_empty() {
            return ToolOutcome::error(
                json!({"error": "missing or empty quiz title"}),
                "The quiz could not be saved because it has no title.",
            );
        }
        let Some(questions) = arguments.get("questions").and_then(Value::as_array) else {
            return ToolOutcome::error(
                json!({"error": "questions must be an array"}),
                "The quiz could not be saved because it has no questions list.",
            );
        };
        if questions.is_empty() {
            return ToolOutcome::error(
                json!({"error": "questions must not be empty"}),
                "The quiz could not be saved because it has no questions.",
            );
        }

        let file_name = self.next_file_name();
        let path = self.quiz_dir.join(&file_name);
        let document = json!({
            "title": title,
            "questions": questions,
            "saved_unix_ms": current_unix_timestamp_ms(),
        });
        let rendered = match serde_json::to_string_pretty(&document) {
            Ok(rendered) => rendered,
            Err(error) => {
                return ToolOutcome::error(
                    json!({"error": format!("failed to encode quiz: {error}")}),
                    "The quiz could not be encoded for saving.",
                );
            }
        };
        if let Err(error) = write_text_atomic(&path, &rendered) {
            return ToolOutcome::error(
                json!({"error": format!("failed to write quiz file: {error:#}")}),
                "The quiz could not be written to disk.",
            );
        }

        debug!(file = %path.display(), question_count = questions.len(), "saved quiz document");
        ToolOutcome::ok(
            json!({
                "file": file_name,
                "question_count": questions.len(),
            }),
            format!(
                "Saved the quiz \"{title}\" with {} question(s) to {file_name}.",
                questions.len()
            ),
        )
    }
}
