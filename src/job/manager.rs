//! Job control plane: spawn the team runtime as a child process and track it
//! until it reaches a terminal status.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use super::model::{CleanupReport, Job, JobId, JobReport, JobStarted, JobStatus, PaneRecord};
use super::process;
use super::store::JobRegistry;
use super::{JOBS_DIR_ENV, JOB_ID_ENV};
use crate::orchestration::supervisor::Supervisor;
use crate::orchestration::team::TeamConfig;
use crate::paths::TeamPaths;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

const INITIAL_POLL: Duration = Duration::from_millis(500);
const MAX_POLL: Duration = Duration::from_millis(2_000);
pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);
pub const MAX_WAIT: Duration = Duration::from_secs(3_600);
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
const TERMINATE_POLL: Duration = Duration::from_millis(500);

const ORPHAN_ERROR: &str = "Process no longer alive (job manager may have restarted)";

/// How the runtime child is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RuntimeCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// This very binary, `crew runtime`, carrying debug mode over.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = Vec::new();
        if crate::log::is_debug() {
            args.push("--debug".to_string());
        }
        args.push("runtime".to_string());
        Ok(Self { program, args })
    }
}

fn next_delay(delay: Duration) -> Duration {
    delay.mul_f64(1.5).min(MAX_POLL)
}

/// Status the runtime reported on stdout, if it printed anything.
fn reported_status(stdout: &str) -> Option<JobStatus> {
    if stdout.is_empty() {
        return None;
    }
    let status = serde_json::from_str::<Value>(stdout)
        .ok()
        .and_then(|v| v.get("status").and_then(Value::as_str).map(JobStatus::from_reported))
        .unwrap_or(JobStatus::Failed);
    Some(status)
}

pub struct JobManager {
    registry: Arc<JobRegistry>,
    supervisor: Option<Arc<Supervisor>>,
    runtime: RuntimeCommand,
    /// Jobs whose child this manager spawned and is reaping.
    attached: Arc<Mutex<HashSet<JobId>>>,
    terminate_grace: Duration,
    kill_grace: Duration,
}

impl JobManager {
    pub fn new(jobs_dir: impl Into<PathBuf>, runtime: RuntimeCommand) -> Self {
        Self {
            registry: Arc::new(JobRegistry::new(jobs_dir)),
            supervisor: None,
            runtime,
            attached: Arc::new(Mutex::new(HashSet::new())),
            terminate_grace: TERMINATE_GRACE,
            kill_grace: Duration::from_millis(10_000),
        }
    }

    /// Needed to kill worker panes on timeout and cleanup.
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Default grace for [`JobManager::cleanup`].
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Launch the runtime for `config` and return without waiting for it.
    pub async fn start(&self, config: &TeamConfig) -> Result<JobStarted> {
        config.validate()?;
        let files = self.registry.files();
        tokio::fs::create_dir_all(files.dir()).await?;

        let job_id = JobId::generate();
        let mut job = Job::new(job_id.clone());
        job.team_name = Some(config.team_name.clone());
        job.cwd = Some(config.cwd.clone());

        let stdout = tokio::fs::File::create(files.stdout_path(&job_id)).await?.into_std().await;
        let stderr = tokio::fs::File::create(files.stderr_path(&job_id)).await?.into_std().await;

        let mut command = Command::new(&self.runtime.program);
        command
            .args(&self.runtime.args)
            .current_dir(&config.cwd)
            .env(JOB_ID_ENV, job_id.as_str())
            .env(JOBS_DIR_ENV, files.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // out of the caller's process group, so a terminal ^C does not reach it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                clog_error!("job {}: runtime spawn failed: {}", job_id, e);
                job.finish(JobStatus::Failed);
                job.stderr = Some(format!("spawn error: {}", e));
                self.registry.save(&job).await?;
                return Ok(JobStarted {
                    job_id: job_id.to_string(),
                    pid: None,
                    message: format!("Team {} failed to start: {}", config.team_name, e),
                });
            }
        };
        job.pid = child.id();
        self.registry.save(&job).await?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(config)?;
            if let Err(e) = stdin.write_all(&payload).await {
                clog_warn!("job {}: config not delivered: {}", job_id, e);
            }
            // dropping stdin closes it
        }

        self.attached.lock().await.insert(job_id.clone());
        self.watch_exit(job_id.clone(), child);

        clog!(
            "job {} started: team {} pid {:?}",
            job_id,
            config.team_name,
            job.pid
        );
        Ok(JobStarted {
            job_id: job_id.to_string(),
            pid: job.pid,
            message: format!(
                "Team started in background. Call wait with job_id=\"{}\" to block until done.",
                job_id
            ),
        })
    }

    fn watch_exit(&self, job_id: JobId, mut child: Child) {
        let registry = self.registry.clone();
        let attached = self.attached.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    clog_warn!("job {}: wait on runtime failed: {}", job_id, e);
                    None
                }
            };
            if let Err(e) = record_exit(&registry, &job_id, code).await {
                clog_error!("job {}: exit not recorded: {}", job_id, e);
            }
            attached.lock().await.remove(&job_id);
        });
    }

    async fn load(&self, id: &JobId) -> Result<Job> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// A running job whose process is gone and which nobody here is reaping
    /// gets its outcome settled from whatever output it left. With no output
    /// it is failed outright.
    async fn reconcile(&self, job: Job) -> Result<(Job, Option<String>)> {
        if job.status.is_terminal() || self.attached.lock().await.contains(&job.job_id) {
            return Ok((job, None));
        }
        let Some(pid) = job.pid else {
            return Ok((job, None));
        };
        if process::is_alive(pid) {
            return Ok((job, None));
        }

        let stdout = read_output(&self.registry.files().stdout_path(&job.job_id)).await;
        if !stdout.is_empty() {
            clog_debug!("job {}: runtime exited while detached", job.job_id);
            record_exit(&self.registry, &job.job_id, None).await?;
            let settled = self.load(&job.job_id).await?;
            return Ok((settled, None));
        }

        clog_warn!("job {}: pid {} is gone, marking failed", job.job_id, pid);
        let id = job.job_id.clone();
        let stderr = read_output(&self.registry.files().stderr_path(&id)).await;
        let updated = self
            .registry
            .update(&id, |job| {
                job.finish(JobStatus::Failed);
                if !stderr.is_empty() {
                    job.stderr = Some(stderr.clone());
                }
                if job.result.as_deref().map_or(true, str::is_empty) {
                    job.result = Some(serde_json::json!({ "error": ORPHAN_ERROR }).to_string());
                }
            })
            .await?
            .unwrap_or(job);
        Ok((updated, Some(ORPHAN_ERROR.to_string())))
    }

    /// Current state, without blocking on the job.
    pub async fn status(&self, id: &JobId) -> Result<JobReport> {
        let job = self.load(id).await?;
        let (job, error) = self.reconcile(job).await?;
        let report = JobReport::from_job(&job);
        Ok(match error {
            Some(error) => report.with_error(error),
            None => report,
        })
    }

    /// Block until the job is terminal or `timeout` (default five minutes,
    /// capped at an hour) runs out. On timeout the job is marked `timeout`,
    /// its runtime is stopped and its worker panes are killed.
    pub async fn wait(&self, id: &JobId, timeout: Option<Duration>) -> Result<JobReport> {
        let timeout = timeout.unwrap_or(DEFAULT_WAIT).min(MAX_WAIT);
        let deadline = Instant::now() + timeout;
        let mut delay = INITIAL_POLL;

        loop {
            let job = self.load(id).await?;
            let (job, error) = self.reconcile(job).await?;
            if job.status.is_terminal() {
                let report = JobReport::from_job(&job);
                return Ok(match error {
                    Some(error) => report.with_error(error),
                    None => report,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(delay.min(deadline - now)).await;
            delay = next_delay(delay);
        }

        self.expire(id, timeout).await
    }

    async fn expire(&self, id: &JobId, timeout: Duration) -> Result<JobReport> {
        // before anything else, so a late exit cannot claim the outcome
        let expired = self.registry.finish(id, JobStatus::Timeout, |_| {}).await?;
        let job = self.load(id).await?;
        if !expired {
            clog_debug!("job {}: settled as {} at the deadline", id, job.status);
            return Ok(JobReport::from_job(&job));
        }
        clog_warn!("job {}: timed out after {:?}", id, timeout);

        if let Some(pid) = job.pid {
            self.stop_process(pid).await;
        }
        let stderr = read_output(&self.registry.files().stderr_path(id)).await;

        let panes = self.pane_record(&job).await;
        if !panes.pane_ids.is_empty() {
            match &self.supervisor {
                Some(supervisor) => {
                    supervisor
                        .kill_panes(
                            &panes.pane_ids,
                            panes.leader_pane_id.as_deref(),
                            Duration::ZERO,
                            shutdown_path(&job).as_deref(),
                        )
                        .await;
                }
                None => clog_warn!("job {}: no multiplexer, {} pane(s) left", id, panes.pane_ids.len()),
            }
        }

        let job = self
            .registry
            .update(id, |job| {
                job.pane_ids = panes.pane_ids.clone();
                job.leader_pane_id = panes.leader_pane_id.clone();
                if !stderr.is_empty() {
                    job.stderr = Some(stderr.clone());
                }
            })
            .await?
            .unwrap_or(job);
        Ok(JobReport::from_job(&job).with_error(format!(
            "Timed out waiting for job {} after {}s",
            id,
            timeout.as_secs()
        )))
    }

    /// SIGTERM, a bounded wait, then SIGKILL.
    async fn stop_process(&self, pid: u32) {
        if let Err(e) = process::terminate(pid) {
            clog_warn!("SIGTERM to {} failed: {}", pid, e);
        }
        let deadline = Instant::now() + self.terminate_grace;
        while process::is_alive(pid) && Instant::now() < deadline {
            sleep(TERMINATE_POLL.min(self.terminate_grace)).await;
        }
        if process::is_alive(pid) {
            clog_warn!("runtime {} ignored SIGTERM, killing", pid);
            if let Err(e) = process::force_kill(pid) {
                clog_warn!("SIGKILL to {} failed: {}", pid, e);
            }
        }
    }

    /// The runtime's pane file wins over what the job record remembers.
    async fn pane_record(&self, job: &Job) -> PaneRecord {
        match self.registry.files().read_panes(&job.job_id).await {
            Some(record) => record,
            None => PaneRecord {
                pane_ids: job.pane_ids.clone(),
                leader_pane_id: job.leader_pane_id.clone(),
                session_name: None,
            },
        }
    }

    /// Kill the worker panes of a finished job. Running jobs are refused:
    /// their runtime still owns the panes.
    pub async fn cleanup(&self, id: &JobId, grace: Option<Duration>) -> Result<CleanupReport> {
        let job = self.load(id).await?;
        let (job, _) = self.reconcile(job).await?;
        if !job.status.is_terminal() {
            return Err(Error::JobStillRunning(id.to_string()));
        }

        let panes = self.pane_record(&job).await;
        if panes.pane_ids.is_empty() {
            return Ok(CleanupReport {
                job_id: id.to_string(),
                panes_killed: 0,
                message: "No pane IDs recorded for this job; nothing to clean up.".to_string(),
            });
        }
        let supervisor = self.supervisor.as_ref().ok_or(Error::TmuxNotFound)?;
        let killed = panes
            .pane_ids
            .iter()
            .filter(|p| Some(p.as_str()) != panes.leader_pane_id.as_deref())
            .count();
        supervisor
            .kill_panes(
                &panes.pane_ids,
                panes.leader_pane_id.as_deref(),
                grace.unwrap_or(self.kill_grace),
                shutdown_path(&job).as_deref(),
            )
            .await;

        self.registry
            .update(id, |job| job.cleaned_up_at = Some(Utc::now()))
            .await?;
        clog!("job {}: cleaned up {} pane(s)", id, killed);
        Ok(CleanupReport {
            job_id: id.to_string(),
            panes_killed: killed,
            message: format!("Cleaned up {} worker pane(s).", killed),
        })
    }
}

fn shutdown_path(job: &Job) -> Option<PathBuf> {
    let (Some(team), Some(cwd)) = (&job.team_name, &job.cwd) else {
        return None;
    };
    TeamPaths::new(cwd, team).ok().map(|p| p.shutdown())
}

async fn read_output(path: &std::path::Path) -> String {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Settle a job from its runtime's output: the stdout summary decides when
/// present, the exit code otherwise. Output is recorded even when an
/// earlier terminal status stands.
async fn record_exit(registry: &JobRegistry, id: &JobId, code: Option<i32>) -> Result<()> {
    let files = registry.files();
    let stdout = read_output(&files.stdout_path(id)).await;
    let stderr = read_output(&files.stderr_path(id)).await;
    let status = reported_status(&stdout).unwrap_or_else(|| JobStatus::from_exit_code(code));

    let changed = registry
        .finish(id, status, |job| {
            if !stdout.is_empty() {
                job.result = Some(stdout.clone());
            }
            if !stderr.is_empty() {
                job.stderr = Some(stderr.clone());
            }
        })
        .await?;
    clog_debug!(
        "job {}: runtime exited code={:?} status={} applied={}",
        id,
        code,
        status,
        changed
    );
    Ok(())
}
