//! Worker CLI contracts.
//!
//! Each supported worker kind maps to a binary, the flags that skip its
//! interactive approvals, and a rule for turning its raw output into a
//! summary string.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::blocking_with_timeout;
use crate::{clog_debug, Error, Result};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    pub fn binary(&self) -> &'static str {
        self.as_str()
    }

    pub fn install_instructions(&self) -> &'static str {
        match self {
            AgentKind::Claude => "Install Claude CLI: https://claude.ai/download",
            AgentKind::Codex => "Install Codex CLI: npm install -g @openai/codex",
            AgentKind::Gemini => "Install Gemini CLI: npm install -g @google/gemini-cli",
        }
    }

    fn auto_approve_flag(&self) -> &'static str {
        match self {
            AgentKind::Claude => "--dangerously-skip-permissions",
            AgentKind::Codex => "--full-auto",
            AgentKind::Gemini => "--yolo",
        }
    }

    /// Gemini asks whether to trust the folder before it accepts input.
    pub fn needs_trust_answer(&self) -> bool {
        matches!(self, AgentKind::Gemini)
    }

    pub fn launch_args(&self, model: Option<&str>, extra_flags: &[String]) -> Vec<String> {
        let mut args = vec![self.auto_approve_flag().to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.extend(extra_flags.iter().cloned());
        args
    }

    /// Reduce raw CLI output to the payload worth reporting.
    pub fn parse_output(&self, raw: &str) -> String {
        match self {
            AgentKind::Codex => parse_jsonl_output(raw),
            AgentKind::Claude | AgentKind::Gemini => raw.trim().to_string(),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            _ => Err(Error::UnknownAgentKind(s.to_string())),
        }
    }
}

/// Scan from the last line backwards for an assistant message or a result
/// record; fall back to the trimmed raw text.
fn parse_jsonl_output(raw: &str) -> String {
    for line in raw.trim().lines().rev().filter(|l| !l.trim().is_empty()) {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let field = |name: &str| record.get(name).and_then(Value::as_str);
        if field("type") == Some("message") && field("role") == Some("assistant") {
            return field("content").unwrap_or(raw).to_string();
        }
        if field("type") == Some("result") || record.get("output").is_some() {
            return field("output")
                .or_else(|| field("result"))
                .unwrap_or(raw)
                .to_string();
        }
    }
    raw.trim().to_string()
}

/// Everything needed to build one worker's launch line.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub team_name: String,
    pub worker_name: String,
    pub kind: AgentKind,
    pub model: Option<String>,
    pub extra_flags: Vec<String>,
}

impl WorkerLaunch {
    pub fn new(team_name: &str, worker_name: &str, kind: AgentKind) -> Self {
        Self {
            team_name: team_name.to_string(),
            worker_name: worker_name.to_string(),
            kind,
            model: None,
            extra_flags: Vec::new(),
        }
    }

    pub fn command(&self) -> String {
        let args = self
            .kind
            .launch_args(self.model.as_deref(), &self.extra_flags);
        std::iter::once(self.kind.binary().to_string())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Identity a worker reads from its environment.
    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "CREW_TEAM_WORKER".to_string(),
                format!("{}/{}", self.team_name, self.worker_name),
            ),
            ("CREW_TEAM_NAME".to_string(), self.team_name.clone()),
            (
                "CREW_WORKER_AGENT_TYPE".to_string(),
                self.kind.as_str().to_string(),
            ),
        ])
    }
}

/// Whether the worker binary is installed and answers `--version`.
pub async fn is_available(kind: AgentKind) -> bool {
    let Ok(binary) = which::which(kind.binary()) else {
        return false;
    };
    blocking_with_timeout(VERSION_CHECK_TIMEOUT, move || {
        Ok(std::process::Command::new(binary)
            .arg("--version")
            .output()?
            .status
            .success())
    })
    .await
    .unwrap_or(false)
}

pub async fn validate_available(kind: AgentKind) -> Result<()> {
    if is_available(kind).await {
        clog_debug!("agent {} available", kind);
        Ok(())
    } else {
        Err(Error::AgentNotAvailable(format!(
            "CLI agent '{}' not found. {}",
            kind,
            kind.install_instructions()
        )))
    }
}
