//! Durable task records, one JSON file per task.
//!
//! Every write is a whole-record read-modify-write through a temp file and a
//! rename. Fields this version does not know about are carried through
//! untouched so newer writers never lose data to older ones.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::{read_json_safe, write_json_atomic};
use crate::{clog_debug, clog_trace, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Unknown fields, preserved across rewrites.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskRecord {
    fn check_owner(&self) -> Result<()> {
        if self.owner.is_some() && self.status == TaskStatus::Pending {
            return Err(Error::Validation(format!(
                "task {} has an owner but is still pending",
                self.id
            )));
        }
        Ok(())
    }

    pub fn is_claimable(&self) -> bool {
        self.owner.is_none() && self.status == TaskStatus::Pending
    }
}

/// Input for [`TaskLedger::create_task`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl NewTask {
    pub fn new(subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            description: description.into(),
            blocked_by: Vec::new(),
        }
    }
}

/// Partial update; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the owner.
    pub owner: Option<Option<String>>,
    pub result: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
}

impl TaskUpdate {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: Option<&str>) -> Self {
        self.owner = Some(owner.map(String::from));
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    fn apply(self, task: &mut TaskRecord) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(owner) = self.owner {
            task.owner = owner;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        task.extra.extend(self.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub last_error: String,
    pub retry_count: u32,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// Work that has not reached a terminal state.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_progress
    }

    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskLedger {
    dir: PathBuf,
}

impl TaskLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn failure_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.failure.json", id))
    }

    /// Ids are only ever digits; anything else would let a caller name a
    /// file outside the ledger.
    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Validation(format!("invalid task id: {:?}", id)));
        }
        Ok(())
    }

    pub async fn create_task(&self, new: NewTask) -> Result<TaskRecord> {
        let next = self
            .list_task_ids()
            .await?
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let task = TaskRecord {
            id: next.to_string(),
            subject: new.subject,
            description: new.description,
            status: TaskStatus::Pending,
            owner: None,
            result: None,
            blocked_by: new.blocked_by,
            created_at: Utc::now(),
            completed_at: None,
            extra: Map::new(),
        };
        write_json_atomic(&self.task_path(&task.id), &task).await?;
        clog_debug!("ledger: created task {} ({})", task.id, task.subject);
        Ok(task)
    }

    /// Missing and malformed files are both reported as absent.
    pub async fn read_task(&self, id: &str) -> Option<TaskRecord> {
        Self::validate_id(id).ok()?;
        read_json_safe(&self.task_path(id)).await
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<TaskRecord> {
        Self::validate_id(id)?;
        let mut task = self
            .read_task(id)
            .await
            .ok_or_else(|| Error::Validation(format!("task {} not found", id)))?;
        update.apply(&mut task);
        task.check_owner()?;
        write_json_atomic(&self.task_path(id), &task).await?;
        clog_trace!("ledger: task {} -> {}", id, task.status);
        Ok(task)
    }

    /// Task ids in ascending numeric order. A missing ledger is empty.
    pub async fn list_task_ids(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                if Self::validate_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort_by(|a, b| compare_ids(a, b));
        Ok(ids)
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks = Vec::new();
        for id in self.list_task_ids().await? {
            if let Some(task) = self.read_task(&id).await {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Every blocker exists and is completed.
    pub async fn are_blockers_resolved(&self, blocked_by: &[String]) -> bool {
        for id in blocked_by {
            match self.read_task(id).await {
                Some(task) if task.status == TaskStatus::Completed => {}
                _ => return false,
            }
        }
        true
    }

    /// Lowest-id pending, unowned task whose blockers are all completed.
    ///
    /// The candidate is read once more right before it is returned; this
    /// narrows but does not close the window in which another worker can
    /// claim the same task.
    pub async fn find_next_claimable(&self, worker: &str) -> Result<Option<TaskRecord>> {
        for id in self.list_task_ids().await? {
            let Some(task) = self.read_task(&id).await else {
                continue;
            };
            if !task.is_claimable() || !self.are_blockers_resolved(&task.blocked_by).await {
                continue;
            }
            match self.read_task(&id).await {
                Some(fresh) if fresh.is_claimable() => {
                    clog_debug!("ledger: task {} claimable by {}", id, worker);
                    return Ok(Some(fresh));
                }
                _ => clog_debug!("ledger: task {} taken before {} could claim it", id, worker),
            }
        }
        Ok(None)
    }

    /// Take ownership of the next claimable task, if any.
    pub async fn claim_next(&self, worker: &str) -> Result<Option<TaskRecord>> {
        let Some(task) = self.find_next_claimable(worker).await? else {
            return Ok(None);
        };
        let update = TaskUpdate::default()
            .status(TaskStatus::InProgress)
            .owner(Some(worker))
            .field("claimedAt", Utc::now().to_rfc3339());
        self.update_task(&task.id, update).await.map(Some)
    }

    pub async fn counts(&self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for task in self.list_tasks().await? {
            counts.add(task.status);
        }
        Ok(counts)
    }

    /// Record a failed attempt, bumping the retry count of any earlier one.
    pub async fn write_task_failure(&self, id: &str, error: &str) -> Result<TaskFailure> {
        Self::validate_id(id)?;
        let previous = self.read_task_failure(id).await;
        let failure = TaskFailure {
            last_error: error.to_string(),
            retry_count: previous.map(|f| f.retry_count + 1).unwrap_or(1),
            last_failed_at: Utc::now(),
        };
        write_json_atomic(&self.failure_path(id), &failure).await?;
        Ok(failure)
    }

    pub async fn read_task_failure(&self, id: &str) -> Option<TaskFailure> {
        Self::validate_id(id).ok()?;
        read_json_safe(&self.failure_path(id)).await
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
