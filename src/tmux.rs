use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{clog_debug, clog_trace, clog_warn, Error, Result};

const SESSION_PREFIX: &str = "crew-team";
const MAX_NAME_LEN: usize = 50;
const MIN_NAME_LEN: usize = 2;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Control surface of the terminal multiplexer.
///
/// Implementors only provide [`Multiplexer::exec`]; every pane operation is
/// expressed on top of it so tests can script a fake.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Run one control command and return its stdout.
    async fn exec(&self, args: &[&str]) -> Result<String>;

    /// Whether the current process runs inside a multiplexer session.
    fn inside_session(&self) -> bool {
        std::env::var("TMUX").is_ok()
    }

    async fn display(&self, target: Option<&str>, format: &str) -> Result<String> {
        let out = match target {
            Some(t) => self.exec(&["display-message", "-p", "-t", t, format]).await?,
            None => self.exec(&["display-message", "-p", format]).await?,
        };
        Ok(out.trim().to_string())
    }

    /// Split `target` and return the new pane's id (`%N`).
    async fn split_window(&self, target: &str, horizontal: bool, cwd: &Path) -> Result<String> {
        let cwd = cwd.display().to_string();
        let flag = if horizontal { "-h" } else { "-v" };
        let out = self
            .exec(&[
                "split-window", flag, "-t", target, "-d", "-P", "-F", "#{pane_id}", "-c", &cwd,
            ])
            .await?;
        let pane_id = out.lines().next().unwrap_or("").trim().to_string();
        if pane_id.is_empty() {
            return Err(Error::Tmux(format!("split-window on {} returned no pane id", target)));
        }
        Ok(pane_id)
    }

    async fn select_layout(&self, target: &str, layout: &str) -> Result<()> {
        self.exec(&["select-layout", "-t", target, layout]).await.map(|_| ())
    }

    async fn set_window_option(&self, target: &str, key: &str, value: &str) -> Result<()> {
        self.exec(&["set-window-option", "-t", target, key, value])
            .await
            .map(|_| ())
    }

    async fn set_option(&self, target: &str, key: &str, value: &str) -> Result<()> {
        self.exec(&["set-option", "-t", target, key, value]).await.map(|_| ())
    }

    async fn select_pane(&self, pane: &str) -> Result<()> {
        self.exec(&["select-pane", "-t", pane]).await.map(|_| ())
    }

    /// Type `text` verbatim; never interpreted as key names.
    async fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
        self.exec(&["send-keys", "-t", pane, "-l", "--", text])
            .await
            .map(|_| ())
    }

    /// Press a named key (`C-m`, `Tab`, `C-c`, `Enter`).
    async fn send_key(&self, pane: &str, key: &str) -> Result<()> {
        self.exec(&["send-keys", "-t", pane, key]).await.map(|_| ())
    }

    /// Last `lines` lines of the pane's scroll-back.
    async fn capture_tail(&self, pane: &str, lines: u16) -> Result<String> {
        let start = format!("-{}", lines);
        self.exec(&["capture-pane", "-t", pane, "-p", "-S", &start]).await
    }

    /// `true` when the pane still exists and its process has not exited.
    async fn pane_alive(&self, pane: &str) -> Result<bool> {
        Ok(self.display(Some(pane), "#{pane_dead}").await? == "0")
    }

    async fn kill_pane(&self, pane: &str) -> Result<()> {
        self.exec(&["kill-pane", "-t", pane]).await.map(|_| ())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.exec(&["kill-session", "-t", name]).await.map(|_| ())
    }

    async fn has_session(&self, name: &str) -> bool {
        self.exec(&["has-session", "-t", name]).await.is_ok()
    }
}

/// The real `tmux` binary.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: PathBuf,
    timeout: Duration,
}

impl Tmux {
    /// Locate `tmux` on `PATH`.
    pub fn new() -> Result<Self> {
        let binary = which::which("tmux").map_err(|_| Error::TmuxNotFound)?;
        clog_debug!("Tmux::new binary={}", binary.display());
        Ok(Self {
            binary,
            timeout: COMMAND_TIMEOUT,
        })
    }
}

#[async_trait]
impl Multiplexer for Tmux {
    async fn exec(&self, args: &[&str]) -> Result<String> {
        clog_trace!("tmux {}", args.join(" "));
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::TmuxNotFound
            } else {
                Error::Io(e)
            }
        })?;

        if !output.status.success() {
            let err = format!(
                "{} failed: {}",
                args.first().copied().unwrap_or("tmux"),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            clog_trace!("tmux error: {}", err);
            return Err(Error::Tmux(err));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Keep only `[A-Za-z0-9-]`, reject results shorter than two characters and
/// truncate to fifty.
pub fn sanitize_name(name: &str) -> Result<String> {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if sanitized.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "contains no valid characters (alphanumeric or hyphen)".to_string(),
        });
    }
    if sanitized.len() < MIN_NAME_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!(
                "too short after sanitization (minimum {} characters)",
                MIN_NAME_LEN
            ),
        });
    }
    Ok(sanitized.chars().take(MAX_NAME_LEN).collect())
}

/// `crew-team-{team}-{worker}`
pub fn session_name(team_name: &str, worker_name: &str) -> Result<String> {
    Ok(format!(
        "{}-{}-{}",
        SESSION_PREFIX,
        sanitize_name(team_name)?,
        sanitize_name(worker_name)?
    ))
}

/// A `session:window` handle means the team lives inside somebody else's
/// session.
pub fn is_split_handle(session: &str) -> bool {
    session.contains(':')
}

pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Best-effort wrapper: log and drop transport errors.
pub(crate) async fn quietly<T>(what: &str, fut: impl std::future::Future<Output = Result<T>>) -> Option<T> {
    match fut.await {
        Ok(v) => Some(v),
        Err(e) => {
            clog_warn!("tmux {} failed: {}", what, e);
            None
        }
    }
}
