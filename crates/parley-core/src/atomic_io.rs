use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

/// Distinguishes temp files written by concurrent calls within one process.
static WRITE_NONCE: AtomicU64 = AtomicU64::new(0);

/// Replaces the file at `path` with `content` by writing a sibling temp
/// file, syncing it, and renaming it over the target, so a concurrent
/// reader sees either the old content or the new content and never a
/// partial write. The temp file is removed if any step fails.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }
    ensure_parent_dir(path)?;

    let temp_path = sibling_temp_path(path);
    let outcome = persist_bytes(&temp_path, content.as_bytes(), path);
    if outcome.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    outcome
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))
}

fn sibling_temp_path(target: &Path) -> PathBuf {
    let nonce = WRITE_NONCE.fetch_add(1, Ordering::Relaxed);
    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("write");
    target.with_file_name(format!(".{stem}.{}.{nonce}.part", std::process::id()))
}

fn persist_bytes(temp_path: &Path, bytes: &[u8], target: &Path) -> Result<()> {
    let mut file = File::create(temp_path)
        .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync temporary file {}", temp_path.display()))?;
    drop(file);
    fs::rename(temp_path, target).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            target.display()
        )
    })
}
