//! End-to-end exercises of the turn orchestrator against a scripted
//! streaming client and the real JSONL conversation store.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use parley_ai::{
    ChatByteStream, ChatClient, ChatRequest, ChatResponse, MessageRole, ParleyAiError,
    ToolDefinition,
};
use parley_relay::{
    ClientFrame, ConversationStore, RelaySink, SinkError, ToolHandler, ToolOutcome, ToolRegistry,
    TurnConfig, TurnOrchestrator, TurnOutcomeMarker, TurnStatus,
};
use parley_session::JsonlConversationStore;
use serde_json::{json, Value};
use tempfile::tempdir;

fn sse_event(payload: &Value) -> Vec<u8> {
    format!("data: {payload}\n\n").into_bytes()
}

fn content_chunk(text: &str) -> Vec<u8> {
    sse_event(&json!({"choices": [{"delta": {"content": text}}]}))
}

fn finish_chunk(reason: &str) -> Vec<u8> {
    sse_event(&json!({"choices": [{"delta": {}, "finish_reason": reason}]}))
}

fn tool_call_chunk(index: u64, id: &str, name: &str, arguments: &str) -> Vec<u8> {
    sse_event(&json!({
        "choices": [{
            "delta": {
                "tool_calls": [{
                    "index": index,
                    "id": id,
                    "function": {"name": name, "arguments": arguments}
                }]
            }
        }]
    }))
}

fn done_chunk() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

fn simple_reply(text: &str) -> ScriptedStream {
    ScriptedStream::Chunks(vec![content_chunk(text), finish_chunk("stop"), done_chunk()])
}

enum ScriptedStream {
    Chunks(Vec<Vec<u8>>),
    HangAfter(Vec<Vec<u8>>),
}

/// Chat client replaying one scripted byte stream per opened turn while
/// recording every request it receives.
struct ScriptedStreamClient {
    streams: Mutex<VecDeque<ScriptedStream>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedStreamClient {
    fn new(streams: Vec<ScriptedStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for ScriptedStreamClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ParleyAiError> {
        Err(ParleyAiError::InvalidResponse(
            "scripted client only streams".to_string(),
        ))
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<ChatByteStream, ParleyAiError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let script = self
            .streams
            .lock()
            .ok()
            .and_then(|mut streams| streams.pop_front())
            .unwrap_or(ScriptedStream::Chunks(Vec::new()));
        match script {
            ScriptedStream::Chunks(chunks) => {
                Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
            }
            ScriptedStream::HangAfter(chunks) => Ok(Box::pin(
                stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending()),
            )),
        }
    }
}

/// Sink capturing every frame for later assertions.
#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<ClientFrame>>,
}

impl CollectingSink {
    fn frames(&self) -> Vec<ClientFrame> {
        self.frames
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelaySink for CollectingSink {
    async fn emit(&self, frame: ClientFrame) -> Result<(), SinkError> {
        let Ok(mut frames) = self.frames.lock() else {
            return Err(SinkError::Closed);
        };
        frames.push(frame);
        Ok(())
    }
}

struct QuizFixtureTool;

#[async_trait]
impl ToolHandler for QuizFixtureTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "save_quiz".to_string(),
            description: "Persists a quiz document.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"title": {"type": "string"}}
            }),
        }
    }

    async fn execute(&self, _arguments: Value) -> ToolOutcome {
        ToolOutcome::ok(
            json!({"file": "quiz-1.json"}),
            "Saved the quiz to quiz-1.json.",
        )
    }
}

struct Exchange {
    client: Arc<ScriptedStreamClient>,
    sink: Arc<CollectingSink>,
    orchestrator: TurnOrchestrator,
}

fn exchange(root: &Path, streams: Vec<ScriptedStream>, registry: ToolRegistry) -> Exchange {
    let client = Arc::new(ScriptedStreamClient::new(streams));
    let sink = Arc::new(CollectingSink::default());
    let orchestrator = TurnOrchestrator::new(
        client.clone(),
        Arc::new(registry),
        Arc::new(JsonlConversationStore::new(root)),
        sink.clone(),
        TurnConfig::default(),
    );
    Exchange {
        client,
        sink,
        orchestrator,
    }
}

fn conversation_lines(root: &Path, conversation_id: &str) -> Vec<String> {
    let path = root
        .join("conversations")
        .join(format!("{conversation_id}.jsonl"));
    fs::read_to_string(&path)
        .unwrap_or_else(|error| panic!("read {}: {error}", path.display()))
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn integration_streamed_turn_persists_through_the_jsonl_store() {
    let temp = tempdir().expect("tempdir");
    let fixture = exchange(
        temp.path(),
        vec![
            ScriptedStream::Chunks(vec![
                content_chunk("It"),
                content_chunk(" works"),
                finish_chunk("stop"),
                done_chunk(),
            ]),
            simple_reply("Still here"),
        ],
        ToolRegistry::new(),
    );

    let report = fixture
        .orchestrator
        .run_turn("conv-e2e", "First question")
        .await;
    assert_eq!(report.status, TurnStatus::Completed);
    assert_eq!(report.content, "It works");

    let frames = fixture.sink.frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].content, "It");
    assert_eq!(frames[1].content, " works");
    assert!(frames[2].finished);

    let lines = conversation_lines(temp.path(), "conv-e2e");
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("\"record_type\":\"meta\""));
    assert!(lines[1].contains("\"content\":\"First question\""));
    assert!(lines[2].contains("\"content\":\"It works\""));

    let report = fixture
        .orchestrator
        .run_turn("conv-e2e", "Second question")
        .await;
    assert_eq!(report.status, TurnStatus::Completed);
    assert_eq!(report.content, "Still here");

    let requests = fixture.client.recorded_requests();
    assert_eq!(requests.len(), 2);
    let seeded = &requests[1].messages;
    assert_eq!(seeded.len(), 3);
    assert_eq!(seeded[0].role, MessageRole::User);
    assert_eq!(seeded[0].text_content(), "First question");
    assert_eq!(seeded[1].role, MessageRole::Assistant);
    assert_eq!(seeded[1].text_content(), "It works");
    assert_eq!(seeded[2].text_content(), "Second question");

    assert_eq!(conversation_lines(temp.path(), "conv-e2e").len(), 5);
}

#[tokio::test]
async fn integration_tool_round_trip_persists_the_full_transcript() {
    let temp = tempdir().expect("tempdir");
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(QuizFixtureTool));
    let fixture = exchange(
        temp.path(),
        vec![
            ScriptedStream::Chunks(vec![
                content_chunk("Okay, saving."),
                tool_call_chunk(0, "call_1", "save_quiz", "{\"title\":\"Capitals\"}"),
                finish_chunk("tool_calls"),
                done_chunk(),
            ]),
            simple_reply("Done!"),
        ],
        registry,
    );

    let report = fixture
        .orchestrator
        .run_turn("conv-tools", "Save a quiz")
        .await;
    assert_eq!(report.status, TurnStatus::Completed);
    assert_eq!(report.tool_calls_dispatched, 1);
    assert_eq!(
        report.content,
        "Okay, saving.\n\nSaved the quiz to quiz-1.json.\n\nDone!"
    );

    let requests = fixture.client.recorded_requests();
    assert_eq!(requests.len(), 2);
    let follow_up = requests[1]
        .messages
        .last()
        .expect("follow-up messages must end with the tool result");
    assert_eq!(follow_up.role, MessageRole::Tool);
    assert_eq!(follow_up.tool_call_id.as_deref(), Some("call_1"));

    let history = JsonlConversationStore::new(temp.path())
        .read_history("conv-tools")
        .await
        .expect("read history");
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[1].content,
        "Okay, saving.\n\nSaved the quiz to quiz-1.json.\n\nDone!"
    );
    assert_eq!(history[1].outcome, TurnOutcomeMarker::Completed);
}

#[tokio::test]
async fn integration_cancellation_persists_partial_content_with_a_stopped_marker() {
    let temp = tempdir().expect("tempdir");
    let fixture = exchange(
        temp.path(),
        vec![ScriptedStream::HangAfter(vec![content_chunk(
            "Partial answer",
        )])],
        ToolRegistry::new(),
    );

    let token = fixture.orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        token.cancel();
    });

    let report = fixture
        .orchestrator
        .run_turn("conv-stopped", "Tell me everything")
        .await;
    assert_eq!(report.status, TurnStatus::Stopped);
    assert_eq!(report.content, "Partial answer");
    assert!(report.error.is_none());

    let lines = conversation_lines(temp.path(), "conv-stopped");
    assert!(lines[2].contains("\"outcome\":\"stopped_by_caller\""));

    let history = JsonlConversationStore::new(temp.path())
        .read_history("conv-stopped")
        .await
        .expect("read history");
    assert_eq!(history[1].content, "Partial answer");
    assert_eq!(history[1].outcome, TurnOutcomeMarker::StoppedByCaller);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_conversations_keep_separate_files() {
    let temp = tempdir().expect("tempdir");
    let alpha = exchange(
        temp.path(),
        vec![simple_reply("Alpha reply")],
        ToolRegistry::new(),
    );
    let beta = exchange(
        temp.path(),
        vec![simple_reply("Beta reply")],
        ToolRegistry::new(),
    );

    let (alpha_report, beta_report) = tokio::join!(
        alpha.orchestrator.run_turn("conv-alpha", "Hello alpha"),
        beta.orchestrator.run_turn("conv-beta", "Hello beta"),
    );
    assert_eq!(alpha_report.status, TurnStatus::Completed);
    assert_eq!(beta_report.status, TurnStatus::Completed);

    let store = JsonlConversationStore::new(temp.path());
    let alpha_history = store
        .read_history("conv-alpha")
        .await
        .expect("alpha history");
    assert_eq!(alpha_history.len(), 2);
    assert_eq!(alpha_history[0].content, "Hello alpha");
    assert_eq!(alpha_history[1].content, "Alpha reply");

    let beta_history = store.read_history("conv-beta").await.expect("beta history");
    assert_eq!(beta_history.len(), 2);
    assert_eq!(beta_history[0].content, "Hello beta");
    assert_eq!(beta_history[1].content, "Beta reply");
}
