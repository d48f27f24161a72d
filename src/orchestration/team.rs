//! Team lifecycle: bootstrap state, launch workers, hand out tasks, tear
//! everything down again.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::health::{HealthMonitor, TeamSnapshot};
use super::supervisor::{Supervisor, TeamSession, WorkerSpawn};
use super::watchdog::{CompletionEvent, CompletionHandler, Watchdog, WatchdogHandle};
use crate::agent::{self, AgentKind, WorkerLaunch};
use crate::config::Config;
use crate::core::ledger::{NewTask, TaskLedger, TaskStatus, TaskUpdate};
use crate::core::mailbox::{DoneStatus, InboxKind, InboxMessage, Mailbox};
use crate::paths::{worker_name, TeamPaths};
use crate::tmux::is_split_handle;
use crate::util::{blocking, read_json_safe, write_json_atomic};
use crate::{clog, clog_debug, clog_warn, Error, Result};

const ACK_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Immutable description of a team, persisted as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    pub team_name: String,
    pub worker_count: usize,
    pub agent_types: Vec<AgentKind>,
    pub tasks: Vec<NewTask>,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TeamConfig {
    pub fn validate(&self) -> Result<()> {
        TeamPaths::new(&self.cwd, &self.team_name)?;
        if self.worker_count == 0 {
            return Err(Error::Validation("workerCount must be at least 1".to_string()));
        }
        if self.agent_types.is_empty() {
            return Err(Error::Validation("agentTypes must not be empty".to_string()));
        }
        Ok(())
    }

    /// Worker `i` runs the i-th listed kind, or the first kind when the list
    /// is shorter than the team.
    pub fn agent_for(&self, index: usize) -> AgentKind {
        self.agent_types
            .get(index)
            .or_else(|| self.agent_types.first())
            .copied()
            .unwrap_or(AgentKind::Claude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub name: String,
    pub agent_type: AgentKind,
    pub pane_id: String,
}

/// Persisted as `session.json` so a team can be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    #[serde(flatten)]
    session: TeamSession,
    workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub summary: String,
}

/// Applies worker completions to the ledger and tells the leader.
struct TeamCompletionHandler {
    ledger: TaskLedger,
    supervisor: Arc<Supervisor>,
    leader_pane_id: String,
}

#[async_trait]
impl CompletionHandler for TeamCompletionHandler {
    async fn on_completion(&self, event: CompletionEvent) -> Result<()> {
        let status: TaskStatus = event.status.into();
        let note = format!("[{} {}] {}", event.worker, status, event.summary);
        if let Err(e) = self.supervisor.inject_to_leader(&self.leader_pane_id, &note).await {
            clog_warn!("could not notify leader about {}: {}", event.worker, e);
        }

        let Some(task) = self.ledger.read_task(&event.task_id).await else {
            clog_warn!("{} reported unknown task {}", event.worker, event.task_id);
            return Ok(());
        };
        if task.status == TaskStatus::Completed {
            return Ok(());
        }
        let update = TaskUpdate::default()
            .status(status)
            .result(event.summary.clone())
            .completed_now();
        self.ledger.update_task(&event.task_id, update).await?;
        if event.status == DoneStatus::Failed {
            self.ledger.write_task_failure(&event.task_id, &event.summary).await?;
        }
        Ok(())
    }
}

/// A team between [`TeamLauncher::launch`] and [`TeamLauncher::deliver`].
pub struct LaunchedTeam {
    config: TeamConfig,
    paths: TeamPaths,
    session: TeamSession,
    workers: Vec<WorkerInfo>,
}

impl LaunchedTeam {
    pub fn session(&self) -> &TeamSession {
        &self.session
    }
}

/// Starts and resumes teams.
pub struct TeamLauncher {
    supervisor: Arc<Supervisor>,
    settings: Config,
    verify_agents: bool,
}

impl TeamLauncher {
    pub fn new(supervisor: Arc<Supervisor>, settings: Config) -> Self {
        Self {
            supervisor,
            settings,
            verify_agents: true,
        }
    }

    /// Skip the `--version` check of each worker binary.
    pub fn verify_agents(mut self, verify: bool) -> Self {
        self.verify_agents = verify;
        self
    }

    pub async fn start(&self, config: TeamConfig) -> Result<Team> {
        let launched = self.launch(config).await?;
        Ok(self.deliver(launched, &CancellationToken::new()).await)
    }

    /// Bootstrap state, build the panes and launch the worker CLIs. Workers
    /// have not been handed anything yet.
    pub async fn launch(&self, config: TeamConfig) -> Result<LaunchedTeam> {
        config.validate()?;
        let paths = TeamPaths::new(&config.cwd, &config.team_name)?;

        if self.verify_agents {
            let kinds: BTreeSet<AgentKind> = config.agent_types.iter().copied().collect();
            for kind in kinds {
                agent::validate_available(kind).await?;
            }
        }

        // a reused team name must not inherit stale task ids
        match tokio::fs::remove_dir_all(paths.tasks_dir()).await {
            Ok(()) => clog_debug!("removed stale ledger of {}", config.team_name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(paths.tasks_dir()).await?;
        write_json_atomic(&paths.config(), &config).await?;

        let ledger = TaskLedger::new(paths.tasks_dir());
        for task in &config.tasks {
            ledger.create_task(task.clone()).await?;
        }

        let mailbox = Mailbox::new(paths.clone());
        let tasks_rel = paths.relative(&paths.tasks_dir());
        for i in 0..config.worker_count {
            let name = worker_name(i);
            tokio::fs::create_dir_all(paths.worker_dir(&name)).await?;
            let welcome = InboxMessage::new(
                InboxKind::Context,
                format!(
                    "# Welcome, {name}\n\nWrite your heartbeat to {hb}, then claim tasks from {tasks}/",
                    hb = paths.relative(&paths.heartbeat(&name)).display(),
                    tasks = tasks_rel.display(),
                ),
            );
            let inbox = mailbox.inbox(&name);
            blocking(move || inbox.append(&welcome)).await?;
        }

        let session = self
            .supervisor
            .create_topology(config.worker_count, &config.cwd)
            .await?;
        let workers: Vec<WorkerInfo> = session
            .worker_pane_ids
            .iter()
            .enumerate()
            .map(|(i, pane)| WorkerInfo {
                name: worker_name(i),
                agent_type: config.agent_for(i),
                pane_id: pane.clone(),
            })
            .collect();

        if let Err(e) = self.spawn_workers(&config, &workers).await {
            self.supervisor
                .teardown(&session.session_name, &session.worker_pane_ids, Some(&session.leader_pane_id))
                .await;
            return Err(e);
        }

        let record = SessionRecord {
            session: session.clone(),
            workers: workers.clone(),
        };
        if let Err(e) = write_json_atomic(&paths.session(), &record).await {
            self.supervisor
                .teardown(&session.session_name, &session.worker_pane_ids, Some(&session.leader_pane_id))
                .await;
            return Err(e);
        }

        Ok(LaunchedTeam {
            config,
            paths,
            session,
            workers,
        })
    }

    /// Hand out the initial tasks and start watching for completions. When
    /// `cancel` fires the remaining deliveries are abandoned; the team is
    /// returned either way so its panes can be shut down.
    pub async fn deliver(&self, launched: LaunchedTeam, cancel: &CancellationToken) -> Team {
        let LaunchedTeam {
            config,
            paths,
            session,
            workers,
        } = launched;
        let mailbox = Mailbox::new(paths.clone());
        let ledger = TaskLedger::new(paths.tasks_dir());

        tokio::select! {
            _ = self.deliver_initial_tasks(&paths, &mailbox, &ledger, &workers) => {}
            _ = cancel.cancelled() => {
                clog_warn!("team {}: stopped during initial delivery", config.team_name);
            }
        }

        let mut team = Team::assemble(config, paths, session, workers, self.supervisor.clone(), &self.settings);
        team.start_watchdog(&self.settings);
        clog!(
            "team {} started with {} worker(s) in {}",
            team.team_name(),
            team.workers.len(),
            team.session.session_name
        );
        team
    }

    async fn spawn_workers(&self, config: &TeamConfig, workers: &[WorkerInfo]) -> Result<()> {
        for worker in workers {
            let mut launch = WorkerLaunch::new(&config.team_name, &worker.name, worker.agent_type);
            launch.model = config.model.clone();
            let spawn = WorkerSpawn {
                kind: Some(worker.agent_type),
                command: launch.command(),
                env: launch.env(),
                working_dir: Some(config.cwd.clone()),
            };
            self.supervisor.spawn(&worker.pane_id, &spawn).await?;
        }
        Ok(())
    }

    /// Each worker boots on its own schedule; worker n gets task n, if any.
    async fn deliver_initial_tasks(
        &self,
        paths: &TeamPaths,
        mailbox: &Mailbox,
        ledger: &TaskLedger,
        workers: &[WorkerInfo],
    ) {
        let deliveries = workers.iter().enumerate().map(|(i, worker)| async move {
            sleep(self.settings.worker_startup_delay()).await;

            if worker.agent_type.needs_trust_answer() {
                if let Err(e) = self.supervisor.send_text(&worker.pane_id, "1").await {
                    clog_warn!("{}: trust answer failed: {}", worker.name, e);
                }
                sleep(self.settings.trust_answer_delay()).await;
            }

            let task_id = (i + 1).to_string();
            let Some(task) = ledger.read_task(&task_id).await else {
                return;
            };
            let instruction = initial_instruction(paths, &worker.name, &task.id, &task.subject, &task.description);
            let message = InboxMessage::new(InboxKind::Task, instruction);
            if let Err(e) = post(mailbox, &worker.name, message, self.settings.max_inbox_lines).await {
                clog_warn!("{}: inbox write failed: {}", worker.name, e);
                return;
            }
            let trigger = format!(
                "Read and execute your task from: {}",
                paths.relative(&paths.inbox(&worker.name)).display()
            );
            if let Err(e) = self.supervisor.send_text(&worker.pane_id, &trigger).await {
                clog_warn!("{}: trigger failed: {}", worker.name, e);
            }
        });
        join_all(deliveries).await;
    }

    /// Reattach to a team from its persisted files. Workers whose panes are
    /// gone are dropped. `None` when there is nothing left to resume.
    pub async fn resume(&self, team_name: &str, cwd: &Path) -> Result<Option<Team>> {
        let paths = TeamPaths::new(cwd, team_name)?;
        let Some(config) = read_json_safe::<TeamConfig>(&paths.config()).await else {
            return Ok(None);
        };
        let Some(record) = read_json_safe::<SessionRecord>(&paths.session()).await else {
            return Ok(None);
        };
        let mux = self.supervisor.multiplexer();
        if !is_split_handle(&record.session.session_name)
            && !mux.has_session(&record.session.session_name).await
        {
            return Ok(None);
        }

        let mut workers = Vec::new();
        for worker in record.workers {
            if self.supervisor.is_alive(&worker.pane_id).await {
                self.supervisor.register_pane(&worker.pane_id, worker.agent_type).await;
                workers.push(worker);
            } else {
                clog_debug!("resume {}: {} is gone", team_name, worker.name);
            }
        }
        if workers.is_empty() {
            return Ok(None);
        }
        let mut session = record.session;
        session.worker_pane_ids = workers.iter().map(|w| w.pane_id.clone()).collect();

        let mut team = Team::assemble(config, paths, session, workers, self.supervisor.clone(), &self.settings);
        team.start_watchdog(&self.settings);
        Ok(Some(team))
    }
}

/// Append to a worker's inbox and rotate it once it passes `max_lines`.
async fn post(mailbox: &Mailbox, worker: &str, message: InboxMessage, max_lines: usize) -> Result<()> {
    let inbox = mailbox.inbox(worker);
    blocking(move || {
        inbox.append(&message)?;
        inbox.rotate_if_exceeds(max_lines)?;
        Ok(())
    })
    .await
}

fn initial_instruction(paths: &TeamPaths, worker: &str, task_id: &str, subject: &str, description: &str) -> String {
    let done = paths.relative(&paths.done(worker));
    [
        "## Initial Task Assignment".to_string(),
        format!("Task ID: {}", task_id),
        format!("Worker: {}", worker),
        format!("Subject: {}", subject),
        String::new(),
        description.to_string(),
        String::new(),
        format!("When complete, write done signal to {}:", done.display()),
        format!(
            "{{\"taskId\":\"{}\",\"status\":\"completed\",\"summary\":\"<brief summary>\",\"completedAt\":\"<ISO timestamp>\"}}",
            task_id
        ),
    ]
    .join("\n")
}

/// A running team.
pub struct Team {
    config: TeamConfig,
    paths: TeamPaths,
    ledger: TaskLedger,
    mailbox: Mailbox,
    supervisor: Arc<Supervisor>,
    monitor: HealthMonitor,
    session: TeamSession,
    workers: Vec<WorkerInfo>,
    watchdog: Option<WatchdogHandle>,
    max_inbox_lines: usize,
}

impl Team {
    fn assemble(
        config: TeamConfig,
        paths: TeamPaths,
        session: TeamSession,
        workers: Vec<WorkerInfo>,
        supervisor: Arc<Supervisor>,
        settings: &Config,
    ) -> Self {
        let ledger = TaskLedger::new(paths.tasks_dir());
        let mailbox = Mailbox::new(paths.clone());
        let monitor = HealthMonitor::new(ledger.clone(), mailbox.clone(), supervisor.clone())
            .with_stall_threshold(settings.stall_threshold());
        Self {
            config,
            paths,
            ledger,
            mailbox,
            supervisor,
            monitor,
            session,
            workers,
            watchdog: None,
            max_inbox_lines: settings.max_inbox_lines,
        }
    }

    fn start_watchdog(&mut self, settings: &Config) {
        let handler = Arc::new(TeamCompletionHandler {
            ledger: self.ledger.clone(),
            supervisor: self.supervisor.clone(),
            leader_pane_id: self.session.leader_pane_id.clone(),
        });
        let names = self.workers.iter().map(|w| w.name.clone()).collect();
        let handle = Watchdog::new(self.mailbox.clone(), names)
            .with_interval(settings.watchdog_interval())
            .spawn(handler);
        self.watchdog = Some(handle);
    }

    pub fn team_name(&self) -> &str {
        &self.config.team_name
    }

    pub fn config(&self) -> &TeamConfig {
        &self.config
    }

    pub fn paths(&self) -> &TeamPaths {
        &self.paths
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn session(&self) -> &TeamSession {
        &self.session
    }

    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    pub async fn snapshot(&self) -> Result<TeamSnapshot> {
        self.monitor.snapshot(self.team_name(), &self.workers).await
    }

    /// Give `task_id` to `worker`: ledger first, then inbox, then a short
    /// trigger in the worker's pane.
    pub async fn assign_task(&self, task_id: &str, worker: &str) -> Result<()> {
        let pane = self
            .workers
            .iter()
            .find(|w| w.name == worker)
            .map(|w| w.pane_id.clone())
            .ok_or_else(|| Error::Validation(format!("no worker named {}", worker)))?;

        let update = TaskUpdate::default()
            .status(TaskStatus::InProgress)
            .owner(Some(worker))
            .field("assignedAt", Utc::now().to_rfc3339());
        self.ledger.update_task(task_id, update).await?;

        let task_file = self.paths.relative(&self.paths.tasks_dir().join(format!("{}.json", task_id)));
        let message = InboxMessage::new(
            InboxKind::Task,
            format!(
                "## New Task Assignment\nTask ID: {}\nClaim and execute task from: {}",
                task_id,
                task_file.display()
            ),
        );
        post(&self.mailbox, worker, message, self.max_inbox_lines).await?;

        if let Some(watchdog) = &self.watchdog {
            watchdog.rearm(worker).await;
        }
        self.supervisor.send_text(&pane, &format!("new-task:{}", task_id)).await
    }

    pub async fn task_results(&self) -> Vec<TaskResult> {
        self.ledger
            .list_tasks()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|t| TaskResult {
                task_id: t.id,
                status: t.status,
                summary: t.result.unwrap_or_default(),
            })
            .collect()
    }

    pub async fn stop_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.shutdown().await;
        }
    }

    /// Ask workers to stop, wait up to `ack_timeout` for their acks, destroy
    /// the panes and purge the team's state directory.
    pub async fn shutdown(mut self, ack_timeout: std::time::Duration) -> Result<()> {
        self.stop_watchdog().await;
        shutdown_team(&self.supervisor, &self.paths, &self.session, &self.workers, ack_timeout).await
    }
}

pub async fn shutdown_team(
    supervisor: &Supervisor,
    paths: &TeamPaths,
    session: &TeamSession,
    workers: &[WorkerInfo],
    ack_timeout: std::time::Duration,
) -> Result<()> {
    let mailbox = Mailbox::new(paths.clone());
    mailbox.write_shutdown_signal(Some("team shutdown")).await?;

    let deadline = Instant::now() + ack_timeout;
    let mut waiting: Vec<&str> = workers.iter().map(|w| w.name.as_str()).collect();
    while !waiting.is_empty() && Instant::now() < deadline {
        let mut still = Vec::with_capacity(waiting.len());
        for name in waiting {
            if !tokio::fs::try_exists(paths.shutdown_ack(name)).await.unwrap_or(false) {
                still.push(name);
            }
        }
        waiting = still;
        if !waiting.is_empty() {
            sleep(ACK_POLL).await;
        }
    }
    if !waiting.is_empty() {
        clog_debug!("shutdown {}: no ack from {:?}", paths.team_name(), waiting);
    }

    supervisor
        .teardown(&session.session_name, &session.worker_pane_ids, Some(&session.leader_pane_id))
        .await;

    match tokio::fs::remove_dir_all(paths.root()).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => clog_warn!("could not purge {}: {}", paths.root().display(), e),
    }
    clog!("team {} shut down", paths.team_name());
    Ok(())
}
