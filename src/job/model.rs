use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

const JOB_PREFIX: &str = "crew-";
const JOB_TOKEN_LEN: usize = 12;

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^crew-[a-z0-9]{1,12}$").unwrap());

/// Identifier of a job. Always validated, so it is safe to splice into a
/// file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let token: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(JOB_TOKEN_LEN)
            .collect();
        Self(format!("{}{}", JOB_PREFIX, token))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if JOB_ID_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidJobId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Exit-code fallback used when the runtime printed nothing usable.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => JobStatus::Completed,
            Some(2) => JobStatus::Timeout,
            _ => JobStatus::Failed,
        }
    }

    /// Status reported by the runtime on stdout. Anything unrecognized
    /// counts as a failure.
    pub fn from_reported(raw: &str) -> Self {
        match raw {
            "completed" => JobStatus::Completed,
            "timeout" => JobStatus::Timeout,
            _ => JobStatus::Failed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Persisted as `<jobs dir>/<job id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub pane_ids: Vec<String>,
    #[serde(default)]
    pub leader_pane_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub cleaned_up_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Running,
            pid: None,
            team_name: None,
            cwd: None,
            pane_ids: Vec::new(),
            leader_pane_id: None,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            stderr: None,
            cleaned_up_at: None,
        }
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let end = self.finished_at.unwrap_or(now);
        end.signed_duration_since(self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Move to `status` unless a terminal status was already recorded.
    pub fn finish(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }
}

/// Pane ids recorded by the runtime, `<jobs dir>/<job id>-panes.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneRecord {
    pub pane_ids: Vec<String>,
    #[serde(default)]
    pub leader_pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

/// What `status` and `wait` hand back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub elapsed_seconds: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            status: job.status,
            elapsed_seconds: format!("{:.1}", job.elapsed_seconds(Utc::now())),
            result: job.result.as_deref().map(parse_result),
            stderr: job.stderr.clone().filter(|s| !s.is_empty()),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Structured output stays structured; anything else is kept as text.
fn parse_result(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Returned by `start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub job_id: String,
    pub pid: Option<u32>,
    pub message: String,
}

/// Returned by `cleanup`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub job_id: String,
    pub panes_killed: usize,
    pub message: String,
}
