//! The `crew runtime` child process: run one team until it finishes, fails
//! or is told to stop, then print a summary on stdout.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::health::Phase;
use super::supervisor::TeamSession;
use super::team::{TaskResult, TeamConfig, TeamLauncher};
use crate::agent::AgentKind;
use crate::config::Config;
use crate::core::ledger::NewTask;
use crate::job::{FileJobStore, JobId, JobStatus, PaneRecord, JOBS_DIR_ENV, JOB_ID_ENV};
use crate::{clog, clog_error, clog_warn, Error, Result};

/// Team description as read from stdin. Every field is optional here so
/// that all missing ones can be reported at once.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInput {
    pub team_name: Option<String>,
    pub worker_count: Option<usize>,
    pub agent_types: Option<Vec<String>>,
    pub tasks: Option<Vec<NewTask>>,
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

impl RuntimeInput {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn into_config(self) -> Result<TeamConfig> {
        let mut missing = Vec::new();
        if self.team_name.as_deref().map_or(true, str::is_empty) {
            missing.push("teamName");
        }
        if self.agent_types.as_ref().map_or(true, Vec::is_empty) {
            missing.push("agentTypes");
        }
        if self.tasks.as_ref().map_or(true, Vec::is_empty) {
            missing.push("tasks");
        }
        if self.cwd.is_none() {
            missing.push("cwd");
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let agent_types = self
            .agent_types
            .unwrap_or_default()
            .iter()
            .map(|raw| raw.parse::<AgentKind>())
            .collect::<Result<Vec<_>>>()?;
        let config = TeamConfig {
            team_name: self.team_name.unwrap_or_default(),
            worker_count: self.worker_count.unwrap_or(agent_types.len()),
            agent_types,
            tasks: self.tasks.unwrap_or_default(),
            cwd: self.cwd.unwrap_or_default(),
            model: self.model,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Printed on stdout when the runtime exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeReport {
    pub status: JobStatus,
    pub team_name: String,
    pub task_results: Vec<TaskResult>,
    /// Seconds.
    pub duration: f64,
    pub worker_count: usize,
}

impl RuntimeReport {
    pub fn exit_code(&self) -> i32 {
        if self.status == JobStatus::Completed {
            0
        } else {
            1
        }
    }
}

/// The job this runtime was started for, when started by a job manager.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub files: FileJobStore,
}

impl JobContext {
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(JOB_ID_ENV).ok()?;
        let dir = std::env::var(JOBS_DIR_ENV).ok()?;
        match JobId::parse(&raw) {
            Ok(job_id) => Some(Self {
                job_id,
                files: FileJobStore::new(dir),
            }),
            Err(e) => {
                clog_warn!("ignoring {}: {}", JOB_ID_ENV, e);
                None
            }
        }
    }
}

pub struct Runtime {
    launcher: TeamLauncher,
    poll_interval: Duration,
    ack_timeout: Duration,
    job: Option<JobContext>,
}

impl Runtime {
    pub fn new(launcher: TeamLauncher, settings: &Config) -> Self {
        Self {
            launcher,
            poll_interval: settings.monitor_interval(),
            ack_timeout: settings.shutdown_ack_timeout(),
            job: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job(mut self, job: Option<JobContext>) -> Self {
        self.job = job;
        self
    }

    async fn write_panes(&self, session: &TeamSession) {
        let Some(job) = &self.job else {
            return;
        };
        let record = PaneRecord {
            pane_ids: session.worker_pane_ids.clone(),
            leader_pane_id: Some(session.leader_pane_id.clone()),
            session_name: Some(session.session_name.clone()),
        };
        if let Err(e) = job.files.write_panes(&job.job_id, &record).await {
            clog_warn!("pane file for {} not written: {}", job.job_id, e);
        }
    }

    /// Start the team and poll it until it completes, can no longer make
    /// progress, or `cancel` fires. Once panes exist the team is shut down
    /// in every case, even when `cancel` fires during startup.
    pub async fn run(&self, config: TeamConfig, cancel: CancellationToken) -> Result<RuntimeReport> {
        let started = Instant::now();
        let launched = self.launcher.launch(config).await?;
        self.write_panes(launched.session()).await;
        let mut team = self.launcher.deliver(launched, &cancel).await;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    clog_warn!("runtime {}: interrupted", team.team_name());
                    break JobStatus::Failed;
                }
                _ = sleep(self.poll_interval) => {}
            }

            let snapshot = match team.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    clog_warn!("runtime {}: snapshot failed: {}", team.team_name(), e);
                    continue;
                }
            };
            self.write_panes(team.session()).await;

            let counts = snapshot.task_counts;
            clog!(
                "[runtime] phase={} pending={} inProgress={} completed={} failed={} dead={} elapsedMs={}",
                snapshot.phase,
                counts.pending,
                counts.in_progress,
                counts.completed,
                counts.failed,
                snapshot.dead_workers.len(),
                started.elapsed().as_millis()
            );

            if snapshot.phase == Phase::Completed {
                break JobStatus::Completed;
            }
            if let Some(reason) = snapshot.failure_condition() {
                clog_error!("runtime {}: {}", team.team_name(), reason);
                break JobStatus::Failed;
            }
        };

        team.stop_watchdog().await;
        let task_results = team.task_results().await;
        let team_name = team.team_name().to_string();
        let worker_count = team.workers().len();
        if let Err(e) = team.shutdown(self.ack_timeout).await {
            clog_warn!("runtime {}: shutdown incomplete: {}", team_name, e);
        }

        Ok(RuntimeReport {
            status,
            team_name,
            task_results,
            duration: started.elapsed().as_secs_f64(),
            worker_count,
        })
    }
}

/// Resolves on ^C. A handler that cannot be installed never resolves.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        clog_warn!("SIGINT handler not installed: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = interrupt() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    clog_warn!("SIGTERM handler not installed: {}", e);
                    interrupt().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            interrupt().await;
        }
        clog!("runtime: stop requested");
        token.cancel();
    });
}
