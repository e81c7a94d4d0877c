//! File-backed conversation persistence: one JSONL file per conversation
//! under a state directory, rewritten atomically on every mutation and
//! serialized across processes by a lock file.
use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parley_core::time_utils::current_unix_timestamp_ms;
use parley_relay::{ConversationStore, NewTurn, StoreError, TurnRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod locking;

use locking::acquire_lock;

const CONVERSATION_SCHEMA_VERSION: u32 = 1;
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_LOCK_STALE_MS: u64 = 30_000;
const MAX_CONVERSATION_ID_CHARS: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationMetaRecord {
    schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum ConversationRecord {
    Meta(ConversationMetaRecord),
    Turn(TurnRecord),
}

/// Rejects ids that could escape the conversations directory or collide
/// with lock and temp file names.
pub fn validate_conversation_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("conversation id cannot be empty");
    }
    if id.chars().count() > MAX_CONVERSATION_ID_CHARS {
        bail!("conversation id exceeds {MAX_CONVERSATION_ID_CHARS} characters");
    }
    if let Some(bad) = id
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-' && *ch != '_')
    {
        bail!("conversation id contains unsupported character '{bad}'");
    }
    Ok(())
}

/// Public struct `JsonlConversationStore` used across Parley components.
///
/// Each conversation lives at `<state_dir>/conversations/<id>.jsonl` with a
/// meta header line followed by one turn record per line. Mutations take
/// the conversation's lock file, re-read the file, and rewrite it whole via
/// the atomic writer, so concurrent appends never interleave partial lines.
#[derive(Debug, Clone)]
pub struct JsonlConversationStore {
    state_dir: PathBuf,
    lock_wait_ms: u64,
    lock_stale_ms: u64,
}

impl JsonlConversationStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
            lock_stale_ms: DEFAULT_LOCK_STALE_MS,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir.join("conversations")
    }

    pub fn set_lock_policy(&mut self, lock_wait_ms: u64, lock_stale_ms: u64) {
        self.lock_wait_ms = lock_wait_ms.max(1);
        self.lock_stale_ms = lock_stale_ms;
    }

    fn conversation_path(&self, conversation_id: &str) -> Result<PathBuf> {
        validate_conversation_id(conversation_id)?;
        Ok(self
            .conversations_dir()
            .join(format!("{conversation_id}.jsonl")))
    }

    fn load_turns(&self, conversation_id: &str) -> Result<Vec<TurnRecord>> {
        let path = self.conversation_path(conversation_id)?;
        read_turns(&path)
    }

    fn append_turn_sync(&self, conversation_id: &str, turn: NewTurn) -> Result<TurnRecord> {
        let path = self.conversation_path(conversation_id)?;
        let _lock = acquire_lock(
            &path.with_extension("lock"),
            Duration::from_millis(self.lock_wait_ms),
            Duration::from_millis(self.lock_stale_ms),
        )?;

        let mut turns = read_turns(&path)?;
        let next_id = turns.iter().map(|record| record.id).max().unwrap_or(0) + 1;
        let record = TurnRecord {
            id: next_id,
            role: turn.role,
            content: turn.content,
            tool_call_id: turn.tool_call_id,
            outcome: turn.outcome,
            streaming: false,
            created_at_ms: current_unix_timestamp_ms(),
        };
        turns.push(record.clone());
        write_turns(&path, &turns)?;
        debug!(
            conversation = conversation_id,
            turn_id = record.id,
            "appended conversation turn"
        );
        Ok(record)
    }

    fn mark_streaming_sync(
        &self,
        conversation_id: &str,
        turn_id: u64,
        streaming: bool,
    ) -> Result<()> {
        let path = self.conversation_path(conversation_id)?;
        let _lock = acquire_lock(
            &path.with_extension("lock"),
            Duration::from_millis(self.lock_wait_ms),
            Duration::from_millis(self.lock_stale_ms),
        )?;

        let mut turns = read_turns(&path)?;
        let Some(record) = turns.iter_mut().find(|record| record.id == turn_id) else {
            bail!("turn {turn_id} not found in conversation {conversation_id}");
        };
        record.streaming = streaming;
        write_turns(&path, &turns)
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn read_history(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, StoreError> {
        self.load_turns(conversation_id).map_err(store_error)
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        turn: NewTurn,
    ) -> Result<TurnRecord, StoreError> {
        self.append_turn_sync(conversation_id, turn)
            .map_err(store_error)
    }

    async fn mark_streaming(
        &self,
        conversation_id: &str,
        turn_id: u64,
        streaming: bool,
    ) -> Result<(), StoreError> {
        self.mark_streaming_sync(conversation_id, turn_id, streaming)
            .map_err(store_error)
    }
}

fn store_error(error: anyhow::Error) -> StoreError {
    StoreError(format!("{error:#}"))
}

fn read_turns(path: &Path) -> Result<Vec<TurnRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(path)
        .with_context(|| format!("failed to open conversation file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut turns = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let record =
            serde_json::from_str::<ConversationRecord>(&line).with_context(|| {
                format!(
                    "failed to parse conversation line {} in {}",
                    index + 1,
                    path.display()
                )
            })?;
        match record {
            ConversationRecord::Meta(meta) => {
                if meta.schema_version > CONVERSATION_SCHEMA_VERSION {
                    bail!(
                        "unsupported conversation schema version {} in {} (supported up to {})",
                        meta.schema_version,
                        path.display(),
                        CONVERSATION_SCHEMA_VERSION
                    );
                }
            }
            ConversationRecord::Turn(turn) => turns.push(turn),
        }
    }

    Ok(turns)
}

fn write_turns(path: &Path, turns: &[TurnRecord]) -> Result<()> {
    let meta = ConversationRecord::Meta(ConversationMetaRecord {
        schema_version: CONVERSATION_SCHEMA_VERSION,
    });
    let mut lines = Vec::with_capacity(turns.len() + 1);
    lines.push(serde_json::to_string(&meta).context("failed to encode conversation meta")?);
    for turn in turns {
        let line = serde_json::to_string(&ConversationRecord::Turn(turn.clone()))
            .context("failed to encode conversation turn")?;
        lines.push(line);
    }
    let mut content = lines.join("\n");
    content.push('\n');
    parley_core::write_text_atomic(path, &content)
}
