//! File-based messaging between the orchestrator and its workers.
//!
//! Inbox and outbox are append-only JSON-lines logs, each consumed through a
//! byte cursor stored next to it. The remaining files are single-shot
//! signals: shutdown request, shutdown ack, heartbeat and the done sentinel.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ledger::TaskStatus;
use crate::paths::TeamPaths;
use crate::util::{read_json_safe, remove_file_if_exists, write_json_atomic};
use crate::{clog_debug, clog_warn, Result};

/// One append-only JSON-lines file plus the consumer's byte cursor.
#[derive(Debug, Clone)]
pub struct JsonlLog<T> {
    path: PathBuf,
    cursor_path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    pub fn new(path: impl Into<PathBuf>, cursor_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor_path: cursor_path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Stored cursor, `0` when absent or unreadable.
    pub fn cursor(&self) -> u64 {
        fs::read_to_string(&self.cursor_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn set_cursor(&self, offset: u64) -> Result<()> {
        if let Some(parent) = self.cursor_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.cursor_path, offset.to_string())?;
        Ok(())
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records appended since the last call.
    ///
    /// Only newline-terminated lines are consumed; a trailing partial line
    /// stays behind for the next read. A cursor past the end of the file
    /// means the file was truncated, so reading restarts at `0`.
    pub fn read_new(&self) -> Result<Vec<T>> {
        let bytes = self.read_bytes()?;
        let mut cursor = self.cursor();
        if cursor > bytes.len() as u64 {
            clog_debug!(
                "{}: cursor {} past end ({}), resetting",
                self.path.display(),
                cursor,
                bytes.len()
            );
            cursor = 0;
        }
        let pending = &bytes[cursor as usize..];
        let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') else {
            if cursor != self.cursor() {
                self.set_cursor(cursor)?;
            }
            return Ok(Vec::new());
        };
        let records = parse_lines(&self.path, &pending[..=last_newline]);
        self.set_cursor(cursor + last_newline as u64 + 1)?;
        Ok(records)
    }

    /// Every complete record, ignoring the cursor.
    pub fn read_all(&self) -> Result<Vec<T>> {
        let bytes = self.read_bytes()?;
        let end = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        Ok(parse_lines(&self.path, &bytes[..end]))
    }

    /// Keep the newest half once the log grows past `max_lines` complete
    /// records. A trailing partial line is carried over untouched and the
    /// cursor moves back by exactly the bytes dropped from the front.
    pub fn rotate_if_exceeds(&self, max_lines: usize) -> Result<bool> {
        let bytes = self.read_bytes()?;
        let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

        let mut starts = Vec::new();
        let mut offset = 0;
        for line in bytes[..complete].split_inclusive(|b| *b == b'\n') {
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                starts.push(offset);
            }
            offset += line.len();
        }
        if starts.len() <= max_lines {
            return Ok(false);
        }

        let keep = max_lines / 2;
        let dropped = if keep == 0 { complete } else { starts[starts.len() - keep] };
        let temp = self.path.with_extension("jsonl.tmp");
        fs::write(&temp, &bytes[dropped..])?;
        fs::rename(&temp, &self.path)?;
        self.set_cursor(self.cursor().saturating_sub(dropped as u64))?;
        clog_debug!(
            "{}: rotated {} -> {} lines",
            self.path.display(),
            starts.len(),
            keep
        );
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::write(&self.path, b"")?;
        }
        self.set_cursor(0)
    }
}

fn parse_lines<T: DeserializeOwned>(path: &Path, chunk: &[u8]) -> Vec<T> {
    String::from_utf8_lossy(chunk)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                clog_warn!("{}: skipping malformed line: {}", path.display(), e);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Message,
    Context,
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    #[serde(rename = "type")]
    pub kind: InboxKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboxMessage {
    pub fn new(kind: InboxKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Ready,
    TaskComplete,
    TaskFailed,
    Idle,
    ShutdownAck,
    Heartbeat,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    #[serde(rename = "type")]
    pub kind: OutboxKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn new(kind: OutboxKind) -> Self {
        Self {
            kind,
            task_id: None,
            summary: None,
            message: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSignal {
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownAck {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneStatus {
    Completed,
    Failed,
}

impl From<DoneStatus> for TaskStatus {
    fn from(status: DoneStatus) -> Self {
        match status {
            DoneStatus::Completed => TaskStatus::Completed,
            DoneStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// Sentinel a worker writes when it finishes its task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSignal {
    pub task_id: String,
    pub status: DoneStatus,
    #[serde(default)]
    pub summary: String,
    pub completed_at: DateTime<Utc>,
}

/// Per-team access to every worker's logs and signal files.
#[derive(Debug, Clone)]
pub struct Mailbox {
    paths: TeamPaths,
}

impl Mailbox {
    pub fn new(paths: TeamPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &TeamPaths {
        &self.paths
    }

    pub fn inbox(&self, worker: &str) -> JsonlLog<InboxMessage> {
        JsonlLog::new(self.paths.inbox(worker), self.paths.inbox_cursor(worker))
    }

    pub fn outbox(&self, worker: &str) -> JsonlLog<OutboxMessage> {
        JsonlLog::new(self.paths.outbox(worker), self.paths.outbox_cursor(worker))
    }

    pub async fn write_shutdown_signal(&self, reason: Option<&str>) -> Result<()> {
        let signal = ShutdownSignal {
            requested_at: Utc::now(),
            reason: reason.map(String::from),
        };
        write_json_atomic(&self.paths.shutdown(), &signal).await
    }

    pub async fn check_shutdown_signal(&self) -> Option<ShutdownSignal> {
        read_json_safe(&self.paths.shutdown()).await
    }

    pub async fn delete_shutdown_signal(&self) -> Result<()> {
        remove_file_if_exists(&self.paths.shutdown()).await
    }

    pub async fn write_shutdown_ack(&self, worker: &str, ack: &ShutdownAck) -> Result<()> {
        write_json_atomic(&self.paths.shutdown_ack(worker), ack).await
    }

    pub async fn read_shutdown_ack(&self, worker: &str) -> Option<ShutdownAck> {
        read_json_safe(&self.paths.shutdown_ack(worker)).await
    }

    pub async fn write_heartbeat(&self, worker: &str, current_task_id: Option<&str>) -> Result<()> {
        let heartbeat = Heartbeat {
            updated_at: Utc::now(),
            current_task_id: current_task_id.map(String::from),
        };
        write_json_atomic(&self.paths.heartbeat(worker), &heartbeat).await
    }

    pub async fn read_heartbeat(&self, worker: &str) -> Option<Heartbeat> {
        read_json_safe(&self.paths.heartbeat(worker)).await
    }

    pub async fn write_done(&self, worker: &str, done: &DoneSignal) -> Result<()> {
        write_json_atomic(&self.paths.done(worker), done).await
    }

    pub async fn read_done(&self, worker: &str) -> Option<DoneSignal> {
        read_json_safe(&self.paths.done(worker)).await
    }

    pub async fn delete_done(&self, worker: &str) -> Result<()> {
        remove_file_if_exists(&self.paths.done(worker)).await
    }

    /// Drop every per-worker file; the directory itself stays.
    pub async fn cleanup_worker_files(&self, worker: &str) -> Result<()> {
        let files = [
            self.paths.inbox(worker),
            self.paths.inbox_cursor(worker),
            self.paths.outbox(worker),
            self.paths.outbox_cursor(worker),
            self.paths.heartbeat(worker),
            self.paths.done(worker),
            self.paths.shutdown_ack(worker),
        ];
        for file in files {
            remove_file_if_exists(&file).await?;
        }
        Ok(())
    }
}
