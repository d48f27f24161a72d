//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted multiplexer that keeps pane screens in memory
//! - Supervisors, launchers and team configs with all delays removed

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crew::agent::AgentKind;
use crew::config::Config;
use crew::core::ledger::NewTask;
use crew::orchestration::supervisor::{SendTiming, Supervisor};
use crew::orchestration::{TeamConfig, TeamLauncher};
use crew::tmux::Multiplexer;
use crew::{Error, Result};

pub const LEADER: &str = "%0";
pub const WINDOW: &str = "crew-test:0";

#[derive(Default)]
struct FakeState {
    next_pane: usize,
    /// pane id -> alive
    panes: HashMap<String, bool>,
    screens: HashMap<String, String>,
    typed: HashMap<String, Vec<String>>,
    killed_panes: Vec<String>,
    killed_sessions: Vec<String>,
}

/// In-memory tmux. Typed text stays on screen until a submit key is
/// pressed; every pane starts alive.
pub struct FakeMux {
    state: Mutex<FakeState>,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        let mut state = FakeState {
            next_pane: 1,
            ..Default::default()
        };
        state.panes.insert(LEADER.to_string(), true);
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn set_dead(&self, pane: &str) {
        self.state.lock().unwrap().panes.insert(pane.to_string(), false);
    }

    pub fn typed(&self, pane: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .typed
            .get(pane)
            .cloned()
            .unwrap_or_default()
    }

    pub fn killed_panes(&self) -> Vec<String> {
        self.state.lock().unwrap().killed_panes.clone()
    }

    pub fn killed_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().killed_sessions.clone()
    }

    /// Arguments following `-t`.
    fn target<'a>(args: &[&'a str]) -> Option<&'a str> {
        args.iter()
            .position(|a| *a == "-t")
            .and_then(|i| args.get(i + 1).copied())
    }
}

#[async_trait]
impl Multiplexer for FakeMux {
    fn inside_session(&self) -> bool {
        true
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let target = Self::target(args).map(str::to_string);
        match args.first().copied() {
            Some("display-message") => {
                let format = args.last().copied().unwrap_or_default();
                match (target, format) {
                    (None, _) => Ok(format!("{} {}\n", WINDOW, LEADER)),
                    (Some(_), "#{window_width}") => Ok("200\n".to_string()),
                    (Some(pane), "#{pane_dead}") => match state.panes.get(&pane) {
                        Some(true) => Ok("0\n".to_string()),
                        Some(false) => Ok("1\n".to_string()),
                        None => Err(Error::Tmux(format!("can't find pane: {}", pane))),
                    },
                    _ => Ok(String::new()),
                }
            }
            Some("split-window") => {
                let pane = format!("%{}", state.next_pane);
                state.next_pane += 1;
                state.panes.insert(pane.clone(), true);
                Ok(format!("{}\n", pane))
            }
            Some("send-keys") => {
                let pane = target.unwrap_or_default();
                if !state.panes.contains_key(&pane) {
                    return Err(Error::Tmux(format!("can't find pane: {}", pane)));
                }
                let text = args.last().copied().unwrap_or_default().to_string();
                if args.contains(&"-l") {
                    state.screens.entry(pane.clone()).or_default().push_str(&text);
                    state.typed.entry(pane).or_default().push(text);
                } else if matches!(text.as_str(), "C-m" | "Enter") {
                    state.screens.insert(pane, String::new());
                }
                Ok(String::new())
            }
            Some("capture-pane") => {
                let pane = target.unwrap_or_default();
                Ok(state.screens.get(&pane).cloned().unwrap_or_default())
            }
            Some("kill-pane") => {
                let pane = target.unwrap_or_default();
                state.panes.insert(pane.clone(), false);
                state.killed_panes.push(pane);
                Ok(String::new())
            }
            Some("kill-session") => {
                state.killed_sessions.push(target.unwrap_or_default());
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

/// Settings with every startup and polling delay cut down.
pub fn fast_settings() -> Config {
    Config {
        watchdog_interval_ms: 20,
        monitor_interval_ms: 20,
        worker_startup_delay_ms: 0,
        trust_answer_delay_ms: 0,
        kill_grace_ms: 0,
        shutdown_ack_timeout_ms: 0,
        ..Config::default()
    }
}

pub fn supervisor(mux: Arc<FakeMux>) -> Arc<Supervisor> {
    let supervisor = Supervisor::new(mux, &fast_settings())
        .unwrap()
        .with_timing(SendTiming::instant());
    Arc::new(supervisor)
}

pub fn launcher(mux: Arc<FakeMux>) -> TeamLauncher {
    TeamLauncher::new(supervisor(mux), fast_settings()).verify_agents(false)
}

pub fn team_config(cwd: &Path, team_name: &str, workers: usize, tasks: usize) -> TeamConfig {
    TeamConfig {
        team_name: team_name.to_string(),
        worker_count: workers,
        agent_types: vec![AgentKind::Claude; workers],
        tasks: (1..=tasks)
            .map(|i| NewTask::new(format!("Task {}", i), format!("Do part {} of the work", i)))
            .collect(),
        cwd: cwd.to_path_buf(),
        model: None,
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
