use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{clog_debug, Error, Result};

/// Overrides for the screen-text heuristics of one worker kind.
///
/// Empty lists keep the built-in patterns for that category.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PaneRules {
    #[serde(default)]
    pub busy_patterns: Vec<String>,
    #[serde(default)]
    pub trust_question_patterns: Vec<String>,
    #[serde(default)]
    pub trust_choice_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub watchdog_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub stall_threshold_secs: u64,
    pub worker_startup_delay_ms: u64,
    /// Pause after answering a worker's folder-trust dialog.
    pub trust_answer_delay_ms: u64,
    pub max_message_len: usize,
    /// Inbox lines kept before the oldest half is dropped.
    pub max_inbox_lines: usize,
    pub kill_grace_ms: u64,
    pub shutdown_ack_timeout_ms: u64,
    pub jobs_dir: Option<String>,
    /// Keyed by agent kind (`claude`, `codex`, `gemini`).
    pub agents: HashMap<String, PaneRules>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: 3_000,
            monitor_interval_ms: 5_000,
            stall_threshold_secs: 60,
            worker_startup_delay_ms: 4_000,
            trust_answer_delay_ms: 800,
            max_message_len: 200,
            max_inbox_lines: 500,
            kill_grace_ms: 10_000,
            shutdown_ack_timeout_ms: 2_000,
            jobs_dir: None,
            agents: HashMap::new(),
        }
    }
}

impl Config {
    pub fn crew_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".crew"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::crew_dir()?.join("crew.toml"))
    }

    /// `CREW_JOBS_DIR` wins over the config file, which wins over `~/.crew/team-jobs`.
    pub fn jobs_dir(&self) -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(crate::job::JOBS_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        match &self.jobs_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::crew_dir()?.join("team-jobs")),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn worker_startup_delay(&self) -> Duration {
        Duration::from_millis(self.worker_startup_delay_ms)
    }

    pub fn trust_answer_delay(&self) -> Duration {
        Duration::from_millis(self.trust_answer_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_ack_timeout_ms)
    }

    pub fn rules_for(&self, kind: &str) -> Option<&PaneRules> {
        self.agents.get(kind)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: watchdog={}ms monitor={}ms stall={}s agents={:?}",
            config.watchdog_interval_ms,
            config.monitor_interval_ms,
            config.stall_threshold_secs,
            config.agents.keys().collect::<Vec<_>>()
        );
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
