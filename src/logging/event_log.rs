//! Append-only JSONL event log with durable writes.
//!
//! Each entry is durable on return from [`EventLog::log`]. A pending file acts
//! as a mini write-ahead log: the entry goes to `events.pending` first
//! (fsynced), then is appended to `events.jsonl` (fsynced), then the pending
//! file is removed. A crash at any point is recoverable and never loses an
//! acknowledged entry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::persistence::fsync_dir;
use crate::types::now_iso;

/// A parsed event-log entry: context fields set at log construction (at
/// minimum `session_id`), plus timestamp, event name, and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(flatten)]
    pub context: serde_json::Map<String, Value>,
    pub ts: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl LogEntry {
    pub fn session_id(&self) -> Option<&str> {
        self.context.get("session_id").and_then(Value::as_str)
    }
}

/// Build the minimum log context for a session.
pub fn session_context(session_id: Uuid) -> serde_json::Map<String, Value> {
    let mut context = serde_json::Map::new();
    context.insert(
        "session_id".into(),
        Value::String(session_id.simple().to_string()),
    );
    context
}

/// Per-agent structured event log.
pub struct EventLog {
    path: PathBuf,
    pending_path: PathBuf,
    context: serde_json::Map<String, Value>,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl EventLog {
    /// Open the log file, replaying any pending entry from a prior crash.
    ///
    /// Creates parent directories and fsyncs the directory so the new file's
    /// entry is durable.
    pub async fn open(
        path: impl Into<PathBuf>,
        context: serde_json::Map<String, Value>,
    ) -> SubstratResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        recover_pending(&path).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if let Some(parent) = path.parent() {
            fsync_dir(parent).await?;
        }
        Ok(Self {
            pending_path: pending_path_for(&path),
            path,
            context,
            file: tokio::sync::Mutex::new(Some(file)),
        })
    }

    /// Append one event. Durable on return.
    pub async fn log(&self, event: &str, data: Value) -> SubstratResult<()> {
        let line = self.serialize(event, data)?;
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| SubstratError::Other(anyhow::anyhow!("event log is closed")))?;

        // WAL order: pending first, then the real append, then unlink.
        let mut pending = tokio::fs::File::create(&self.pending_path).await?;
        pending.write_all(&line).await?;
        pending.sync_all().await?;
        drop(pending);

        file.write_all(&line).await?;
        file.sync_all().await?;

        remove_if_exists(&self.pending_path).await?;
        Ok(())
    }

    /// Parse the whole log. A partial trailing line (crash mid-append) is
    /// skipped; an unparseable interior line is a [`SubstratError::CorruptLog`].
    pub async fn read_all(&self) -> SubstratResult<Vec<LogEntry>> {
        read_log(&self.path).await
    }

    /// Close the underlying file. Further `log` calls fail.
    pub async fn close(&self) {
        self.file.lock().await.take();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn serialize(&self, event: &str, data: Value) -> SubstratResult<Vec<u8>> {
        let entry = LogEntry {
            context: self.context.clone(),
            ts: now_iso(),
            event: event.to_string(),
            data,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// If a pending file exists, a prior `log` call was interrupted. Ensure its
/// content appears as the last line of the log (skip if already there),
/// fsync, unlink. Safe to call when no pending file exists.
pub async fn recover_pending(path: &Path) -> SubstratResult<()> {
    let pending_path = pending_path_for(path);
    let pending = match tokio::fs::read(&pending_path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if pending.is_empty() {
        return remove_if_exists(&pending_path).await;
    }

    truncate_partial_tail(path).await?;

    // Already appended before the crash?
    if let Ok(content) = tokio::fs::read(path).await {
        if content.len() >= pending.len() && content[content.len() - pending.len()..] == pending[..]
        {
            return remove_if_exists(&pending_path).await;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&pending).await?;
    file.sync_all().await?;
    drop(file);
    remove_if_exists(&pending_path).await
}

/// Parse a log file directly, without an open [`EventLog`] handle.
pub async fn read_log(path: &Path) -> SubstratResult<Vec<LogEntry>> {
    let content = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // A well-formed log always ends with b'\n'; anything after the last
    // newline is a partial line from a crash mid-append.
    let end = if content.ends_with(b"\n") {
        content.len()
    } else {
        content
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0)
    };

    let text = std::str::from_utf8(&content[..end])
        .map_err(|_| SubstratError::CorruptLog(format!("{}: not valid UTF-8", path.display())))?;

    let mut entries = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(line).map_err(|e| {
            SubstratError::CorruptLog(format!("{}: {e}", path.display()))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn pending_path_for(path: &Path) -> PathBuf {
    path.with_extension("pending")
}

/// Remove an incomplete trailing line left by a crash mid-append.
async fn truncate_partial_tail(path: &Path) -> SubstratResult<()> {
    let content = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> SubstratResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_log(dir: &Path) -> EventLog {
        let session_id = Uuid::new_v4();
        EventLog::open(dir.join("events.jsonl"), session_context(session_id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn log_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;

        log.log("turn.start", json!({"prompt": "hi"})).await.unwrap();
        log.log("turn.complete", json!({"response": "hello"}))
            .await
            .unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "turn.start");
        assert_eq!(entries[0].data["prompt"], "hi");
        assert_eq!(entries[1].event, "turn.complete");
        assert!(entries[0].session_id().is_some());
        assert!(!entries[0].ts.is_empty());
    }

    #[tokio::test]
    async fn log_is_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;

        log.log("a", json!({})).await.unwrap();
        log.log("b", json!({"n": 1})).await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        assert!(content.ends_with('\n'));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: Value = serde_json::from_str(line).unwrap();
            assert!(v.get("ts").is_some());
            assert!(v.get("event").is_some());
        }
    }

    #[tokio::test]
    async fn no_pending_file_after_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.log("x", json!({})).await.unwrap();
        assert!(!dir.path().join("events.pending").exists());
    }

    #[tokio::test]
    async fn recover_replays_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sid = Uuid::new_v4();

        // Simulate a crash after the pending fsync but before the append:
        // the entry exists only in events.pending.
        let entry = format!(
            "{{\"session_id\":\"{}\",\"ts\":\"{}\",\"event\":\"turn.complete\",\"data\":{{}}}}\n",
            sid.simple(),
            now_iso()
        );
        tokio::fs::write(dir.path().join("events.pending"), &entry)
            .await
            .unwrap();

        let log = EventLog::open(&path, session_context(sid)).await.unwrap();
        assert!(!dir.path().join("events.pending").exists());

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "turn.complete");
    }

    #[tokio::test]
    async fn recover_skips_already_appended_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sid = Uuid::new_v4();

        // Crash after the append but before the pending unlink: the entry is
        // in both files and must not be duplicated.
        let entry = format!(
            "{{\"session_id\":\"{}\",\"ts\":\"{}\",\"event\":\"suspend.result\",\"data\":{{\"state_size\":3}}}}\n",
            sid.simple(),
            now_iso()
        );
        tokio::fs::write(&path, &entry).await.unwrap();
        tokio::fs::write(dir.path().join("events.pending"), &entry)
            .await
            .unwrap();

        let log = EventLog::open(&path, session_context(sid)).await.unwrap();
        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn recover_truncates_partial_tail_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sid = Uuid::new_v4();

        let good = format!(
            "{{\"session_id\":\"{}\",\"ts\":\"{}\",\"event\":\"turn.start\",\"data\":{{}}}}\n",
            sid.simple(),
            now_iso()
        );
        let pending = format!(
            "{{\"session_id\":\"{}\",\"ts\":\"{}\",\"event\":\"turn.complete\",\"data\":{{}}}}\n",
            sid.simple(),
            now_iso()
        );
        // Partial third of the pending entry made it to disk before the crash.
        let partial = &pending[..20];
        tokio::fs::write(&path, format!("{good}{partial}")).await.unwrap();
        tokio::fs::write(dir.path().join("events.pending"), &pending)
            .await
            .unwrap();

        let log = EventLog::open(&path, session_context(sid)).await.unwrap();
        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "turn.start");
        assert_eq!(entries[1].event, "turn.complete");
    }

    #[tokio::test]
    async fn recover_removes_empty_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        tokio::fs::write(dir.path().join("events.pending"), b"")
            .await
            .unwrap();

        recover_pending(&path).await.unwrap();
        assert!(!dir.path().join("events.pending").exists());
    }

    #[tokio::test]
    async fn recover_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sid = Uuid::new_v4();

        let entry = format!(
            "{{\"session_id\":\"{}\",\"ts\":\"{}\",\"event\":\"x\",\"data\":{{}}}}\n",
            sid.simple(),
            now_iso()
        );
        tokio::fs::write(dir.path().join("events.pending"), &entry)
            .await
            .unwrap();

        recover_pending(&path).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();
        recover_pending(&path).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn read_all_skips_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.log("ok", json!({})).await.unwrap();

        // Simulate a torn append directly on the file.
        let mut content = tokio::fs::read(log.path()).await.unwrap();
        content.extend_from_slice(b"{\"ts\":\"2026-01-");
        tokio::fs::write(log.path(), &content).await.unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "ok");
    }

    #[tokio::test]
    async fn read_all_errors_on_corrupt_interior_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        tokio::fs::write(&path, b"not json at all\n{\"ts\":\"t\",\"event\":\"e\"}\n")
            .await
            .unwrap();

        let err = read_log(&path).await.unwrap_err();
        assert!(matches!(err, SubstratError::CorruptLog(_)));
    }

    #[tokio::test]
    async fn read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = read_log(&dir.path().join("events.jsonl")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn closed_log_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path()).await;
        log.close().await;
        assert!(log.log("x", json!({})).await.is_err());
    }
}
