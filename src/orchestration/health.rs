//! Health monitoring for a running team.
//!
//! A snapshot combines ledger counts with per-worker liveness and heartbeat
//! age, and derives the team's phase from the counts alone. Heartbeat age is
//! advisory: a worker that never wrote one is reported live and not stalled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::supervisor::Supervisor;
use super::team::WorkerInfo;
use crate::agent::AgentKind;
use crate::core::ledger::{TaskCounts, TaskLedger};
use crate::core::mailbox::{Heartbeat, Mailbox};
use crate::{clog_trace, Result};

/// Default heartbeat age after which a worker is reported stalled.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Executing,
    Fixing,
    Completed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Fixing => "fixing",
            Phase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// First match wins.
pub fn infer_phase(counts: &TaskCounts) -> Phase {
    let TaskCounts {
        pending,
        in_progress,
        completed,
        failed,
    } = *counts;
    if in_progress == 0 && pending > 0 && completed == 0 {
        Phase::Planning
    } else if failed > 0 && pending == 0 && in_progress == 0 {
        Phase::Fixing
    } else if completed > 0 && pending == 0 && in_progress == 0 && failed == 0 {
        Phase::Completed
    } else {
        Phase::Executing
    }
}

pub fn is_stalled(heartbeat: Option<&Heartbeat>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let Some(heartbeat) = heartbeat else {
        return false;
    };
    let age = now.signed_duration_since(heartbeat.updated_at);
    age.to_std().map(|age| age > threshold).unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub name: String,
    pub agent_type: AgentKind,
    pub pane_id: String,
    pub alive: bool,
    pub current_task_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSnapshot {
    pub team_name: String,
    pub phase: Phase,
    pub workers: Vec<WorkerState>,
    pub task_counts: TaskCounts,
    pub dead_workers: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

impl TeamSnapshot {
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Why the team can no longer make progress, if it can't. This is a
    /// failure of the team itself, distinct from an outer wait timing out.
    pub fn failure_condition(&self) -> Option<String> {
        let outstanding = self.task_counts.outstanding();
        let all_dead = !self.workers.is_empty() && self.live_workers() == 0;
        if all_dead && outstanding > 0 {
            return Some(format!(
                "all workers dead with {} task(s) outstanding",
                outstanding
            ));
        }
        if self.phase == Phase::Fixing && all_dead {
            return Some(format!(
                "{} task(s) failed and no workers remain to fix them",
                self.task_counts.failed
            ));
        }
        None
    }
}

pub struct HealthMonitor {
    ledger: TaskLedger,
    mailbox: Mailbox,
    supervisor: Arc<Supervisor>,
    stall_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(ledger: TaskLedger, mailbox: Mailbox, supervisor: Arc<Supervisor>) -> Self {
        Self {
            ledger,
            mailbox,
            supervisor,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub async fn snapshot(&self, team_name: &str, workers: &[WorkerInfo]) -> Result<TeamSnapshot> {
        let task_counts = self.ledger.counts().await?;
        let now = Utc::now();

        let mut states = Vec::with_capacity(workers.len());
        for worker in workers {
            let alive = self.supervisor.is_alive(&worker.pane_id).await;
            let heartbeat = self.mailbox.read_heartbeat(&worker.name).await;
            states.push(WorkerState {
                name: worker.name.clone(),
                agent_type: worker.agent_type,
                pane_id: worker.pane_id.clone(),
                alive,
                current_task_id: heartbeat.as_ref().and_then(|h| h.current_task_id.clone()),
                last_heartbeat: heartbeat.as_ref().map(|h| h.updated_at),
                stalled: is_stalled(heartbeat.as_ref(), now, self.stall_threshold),
            });
        }
        let dead_workers = states
            .iter()
            .filter(|w| !w.alive)
            .map(|w| w.name.clone())
            .collect();
        let phase = infer_phase(&task_counts);
        clog_trace!("snapshot {}: phase={} counts={:?}", team_name, phase, task_counts);

        Ok(TeamSnapshot {
            team_name: team_name.to_string(),
            phase,
            workers: states,
            task_counts,
            dead_workers,
            taken_at: now,
        })
    }
}
