//! Worker pane lifecycle and text injection.
//!
//! The supervisor never tracks pane state authoritatively; it asks the
//! multiplexer and classifies what is on screen. Panes are addressed by
//! their stable ids (`%N`), never by index.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::sleep;

use super::pane::{capture_contains, PanePatterns, PaneState};
use crate::agent::AgentKind;
use crate::config::Config;
use crate::core::mailbox::ShutdownSignal;
use crate::tmux::{is_split_handle, quietly, shell_escape, Multiplexer};
use crate::util::write_json_atomic;
use crate::{clog_debug, clog_warn, Error, Result};

/// Scroll-back lines captured when checking a pane.
const CAPTURE_LINES: u16 = 80;
const SUBMIT_ROUNDS: usize = 6;
const MIN_WIDTH_FOR_HALF_SPLIT: u32 = 40;
const LEADER_PREFIX: &str = "[CREW_INJECT]";

/// Pauses between keystrokes while delivering text. Interactive worker UIs
/// drop keys that arrive faster than they redraw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTiming {
    pub trust_gap: Duration,
    pub after_trust: Duration,
    pub after_type: Duration,
    pub before_round: Duration,
    pub tab_gap: Duration,
    pub submit_gap: Duration,
    pub before_check: Duration,
    pub after_check: Duration,
    pub final_gap: Duration,
    pub interrupt_gap: Duration,
    pub topology_settle: Duration,
}

impl Default for SendTiming {
    fn default() -> Self {
        Self {
            trust_gap: Duration::from_millis(120),
            after_trust: Duration::from_millis(200),
            after_type: Duration::from_millis(150),
            before_round: Duration::from_millis(100),
            tab_gap: Duration::from_millis(80),
            submit_gap: Duration::from_millis(200),
            before_check: Duration::from_millis(140),
            after_check: Duration::from_millis(140),
            final_gap: Duration::from_millis(120),
            interrupt_gap: Duration::from_millis(250),
            topology_settle: Duration::from_millis(300),
        }
    }
}

impl SendTiming {
    /// No pauses at all; for scripted multiplexers.
    pub fn instant() -> Self {
        Self {
            trust_gap: Duration::ZERO,
            after_trust: Duration::ZERO,
            after_type: Duration::ZERO,
            before_round: Duration::ZERO,
            tab_gap: Duration::ZERO,
            submit_gap: Duration::ZERO,
            before_check: Duration::ZERO,
            after_check: Duration::ZERO,
            final_gap: Duration::ZERO,
            interrupt_gap: Duration::ZERO,
            topology_settle: Duration::ZERO,
        }
    }
}

/// Panes making up one team. `session_name` is `session:window` when the
/// team was split into an existing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSession {
    pub session_name: String,
    pub leader_pane_id: String,
    pub worker_pane_ids: Vec<String>,
}

/// What to run in a freshly split pane.
#[derive(Debug, Clone)]
pub struct WorkerSpawn {
    pub kind: Option<AgentKind>,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<std::path::PathBuf>,
}

impl WorkerSpawn {
    /// `env K=V… $SHELL -c "<source rc>; [cd dir &&] exec <command>"`
    ///
    /// The user's rc file is sourced so the worker sees the same `PATH` as an
    /// interactive shell would.
    pub fn launch_line(&self, shell: &str, home: Option<&Path>) -> String {
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_escape(v)))
            .collect();
        let shell_name = Path::new(shell)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bash".to_string());
        let source = home
            .map(|h| {
                let rc = h.join(format!(".{}rc", shell_name)).display().to_string();
                format!("[ -f '{rc}' ] && source '{rc}'; ")
            })
            .unwrap_or_default();
        let cd = self
            .working_dir
            .as_ref()
            .map(|d| format!("cd {} && ", shell_escape(&d.display().to_string())))
            .unwrap_or_default();
        format!(
            "env {} {} -c \"{}{}exec {}\"",
            env.join(" "),
            shell,
            source,
            cd,
            self.command
        )
    }
}

pub struct Supervisor {
    mux: Arc<dyn Multiplexer>,
    default_patterns: PanePatterns,
    kind_patterns: HashMap<AgentKind, PanePatterns>,
    pane_kinds: RwLock<HashMap<String, AgentKind>>,
    timing: SendTiming,
    max_message_len: usize,
}

impl Supervisor {
    pub fn new(mux: Arc<dyn Multiplexer>, config: &Config) -> Result<Self> {
        let mut kind_patterns = HashMap::new();
        for kind in AgentKind::ALL {
            if let Some(rules) = config.rules_for(kind.as_str()) {
                kind_patterns.insert(kind, PanePatterns::from_rules(rules)?);
            }
        }
        Ok(Self {
            mux,
            default_patterns: PanePatterns::default(),
            kind_patterns,
            pane_kinds: RwLock::new(HashMap::new()),
            timing: SendTiming::default(),
            max_message_len: config.max_message_len,
        })
    }

    pub fn with_timing(mut self, timing: SendTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.mux
    }

    async fn patterns_for(&self, pane: &str) -> &PanePatterns {
        let kind = self.pane_kinds.read().await.get(pane).copied();
        kind.and_then(|k| self.kind_patterns.get(&k))
            .unwrap_or(&self.default_patterns)
    }

    /// Remember which worker kind runs in `pane` so its screen heuristics
    /// are used for it.
    pub async fn register_pane(&self, pane: &str, kind: AgentKind) {
        self.pane_kinds.write().await.insert(pane.to_string(), kind);
    }

    async fn capture(&self, pane: &str) -> String {
        self.mux.capture_tail(pane, CAPTURE_LINES).await.unwrap_or_default()
    }

    /// Split one pane per worker off the caller's own pane: the first to the
    /// right of the leader, the rest stacked under the previous worker.
    pub async fn create_topology(&self, worker_count: usize, cwd: &Path) -> Result<TeamSession> {
        if !self.mux.inside_session() {
            return Err(Error::NotInsideTmux);
        }
        let context = self.mux.display(None, "#S:#I #{pane_id}").await?;
        let (target, leader) = context
            .split_once(' ')
            .map(|(t, l)| (t.trim().to_string(), l.trim().to_string()))
            .filter(|(t, l)| !t.is_empty() && !l.is_empty())
            .ok_or_else(|| Error::Tmux(format!("unexpected pane context: {:?}", context)))?;
        let session = target.split(':').next().unwrap_or(&target).to_string();

        let mut workers: Vec<String> = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let split_from = workers.last().unwrap_or(&leader).clone();
            let pane = self.mux.split_window(&split_from, i == 0, cwd).await?;
            clog_debug!("topology: worker pane {} split from {}", pane, split_from);
            workers.push(pane);
        }

        quietly("select-layout", self.mux.select_layout(&target, "main-vertical")).await;
        if let Some(width) = quietly("window width", self.mux.display(Some(&target), "#{window_width}")).await {
            if let Ok(width) = width.parse::<u32>() {
                if width >= MIN_WIDTH_FOR_HALF_SPLIT {
                    let half = (width / 2).to_string();
                    quietly(
                        "main-pane-width",
                        self.mux.set_window_option(&target, "main-pane-width", &half),
                    )
                    .await;
                    quietly("select-layout", self.mux.select_layout(&target, "main-vertical")).await;
                }
            }
        }
        quietly("mouse", self.mux.set_option(&session, "mouse", "on")).await;
        quietly("select-pane", self.mux.select_pane(&leader)).await;
        sleep(self.timing.topology_settle).await;

        Ok(TeamSession {
            session_name: target,
            leader_pane_id: leader,
            worker_pane_ids: workers,
        })
    }

    /// Type the launch line literally, then press Enter.
    pub async fn spawn(&self, pane: &str, spawn: &WorkerSpawn) -> Result<()> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let line = spawn.launch_line(&shell, dirs::home_dir().as_deref());
        if let Some(kind) = spawn.kind {
            self.register_pane(pane, kind).await;
        }
        clog_debug!("spawn in {}: {}", pane, spawn.command);
        self.mux.send_literal(pane, &line).await?;
        self.mux.send_key(pane, "Enter").await
    }

    fn truncate(&self, message: &str) -> String {
        if message.chars().count() > self.max_message_len {
            clog_warn!("message truncated to {} chars", self.max_message_len);
        }
        message.chars().take(self.max_message_len).collect()
    }

    /// Deliver a short line of input and submit it.
    ///
    /// Submission is confirmed by the text disappearing from the pane. When
    /// that never happens the call still succeeds after one last submit: no
    /// acknowledgment channel exists, and a false failure would abort a
    /// healthy team. Only multiplexer errors are returned.
    pub async fn send_text(&self, pane: &str, message: &str) -> Result<()> {
        let message = self.truncate(message);
        let t = self.timing;
        let patterns = self.patterns_for(pane).await;

        let initial = self.capture(pane).await;
        let busy = patterns.is_busy(&initial);
        if patterns.has_trust_prompt(&initial) {
            clog_debug!("send_text {}: dismissing trust prompt", pane);
            self.mux.send_key(pane, "C-m").await?;
            sleep(t.trust_gap).await;
            self.mux.send_key(pane, "C-m").await?;
            sleep(t.after_trust).await;
        }

        self.mux.send_literal(pane, &message).await?;
        sleep(t.after_type).await;

        for round in 0..SUBMIT_ROUNDS {
            sleep(t.before_round).await;
            if round == 0 && busy {
                // queue behind the running turn instead of interrupting it
                self.mux.send_key(pane, "Tab").await?;
                sleep(t.tab_gap).await;
                self.mux.send_key(pane, "C-m").await?;
            } else {
                self.mux.send_key(pane, "C-m").await?;
                sleep(t.submit_gap).await;
                self.mux.send_key(pane, "C-m").await?;
            }
            sleep(t.before_check).await;

            if !capture_contains(&self.capture(pane).await, &message) {
                clog_debug!("send_text {}: submitted after {} round(s)", pane, round + 1);
                return Ok(());
            }
            sleep(t.after_check).await;
        }

        clog_warn!("send_text {}: submission unconfirmed, assuming delivered", pane);
        self.mux.send_key(pane, "C-m").await?;
        sleep(t.final_gap).await;
        self.mux.send_key(pane, "C-m").await
    }

    /// Type a status line into the leader's input. A leader blocked on a
    /// running tool is interrupted first so the line is not queued behind it.
    pub async fn inject_to_leader(&self, leader: &str, message: &str) -> Result<()> {
        let prefixed = self.truncate(&format!("{} {}", LEADER_PREFIX, message));
        let capture = self.capture(leader).await;
        if self.default_patterns.is_busy(&capture) {
            quietly("interrupt leader", self.mux.send_key(leader, "C-c")).await;
            sleep(self.timing.interrupt_gap).await;
        }
        self.send_text(leader, &prefixed).await
    }

    /// A pane that cannot be queried counts as dead.
    pub async fn is_alive(&self, pane: &str) -> bool {
        self.mux.pane_alive(pane).await.unwrap_or(false)
    }

    pub async fn pane_state(&self, pane: &str) -> PaneState {
        if !self.is_alive(pane).await {
            return PaneState::Dead;
        }
        let capture = self.capture(pane).await;
        self.patterns_for(pane).await.classify(&capture, true)
    }

    /// Ask workers to stop, give them `grace`, then kill what is left. The
    /// leader pane is skipped no matter what the caller passes.
    pub async fn kill_panes(
        &self,
        pane_ids: &[String],
        leader: Option<&str>,
        grace: Duration,
        shutdown_signal: Option<&Path>,
    ) {
        if pane_ids.is_empty() {
            return;
        }
        if let Some(path) = shutdown_signal {
            let signal = ShutdownSignal {
                requested_at: Utc::now(),
                reason: None,
            };
            match write_json_atomic(path, &signal).await {
                Ok(()) => sleep(grace).await,
                Err(e) => clog_warn!("kill_panes: shutdown signal not written: {}", e),
            }
        }
        for pane in pane_ids.iter().filter(|p| Some(p.as_str()) != leader) {
            quietly("kill-pane", self.mux.kill_pane(pane)).await;
        }
    }

    /// Destroy the team's panes. A `session:window` handle belongs to
    /// someone else's session, so only worker panes go; otherwise the whole
    /// session is the team's and is killed.
    pub async fn teardown(&self, session: &str, worker_panes: &[String], leader: Option<&str>) {
        if is_split_handle(session) {
            for pane in worker_panes.iter().filter(|p| Some(p.as_str()) != leader) {
                quietly("kill-pane", self.mux.kill_pane(pane)).await;
            }
            return;
        }
        quietly("kill-session", self.mux.kill_session(session)).await;
    }
}
