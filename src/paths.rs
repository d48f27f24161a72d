//! On-disk layout of a team's shared state.
//!
//! ```text
//! <cwd>/.crew/state/team/<team>/
//!     config.json
//!     session.json
//!     shutdown.json
//!     tasks/<id>.json
//!     tasks/<id>.failure.json
//!     workers/<worker>/heartbeat.json
//!     workers/<worker>/inbox.jsonl
//!     workers/<worker>/inbox.offset
//!     workers/<worker>/outbox.jsonl
//!     workers/<worker>/done.json
//!     workers/<worker>/shutdown-ack.json
//! ```
//!
//! Job files live elsewhere (see [`crate::job`]).

use std::path::{Path, PathBuf};

use crate::tmux::sanitize_name;
use crate::Result;

/// Path root of the team tree, relative to the team's working directory.
pub const STATE_SUBDIR: &str = ".crew/state/team";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamPaths {
    team_name: String,
    cwd: PathBuf,
    root: PathBuf,
}

impl TeamPaths {
    /// The team name must already be sanitized; anything else is rejected so
    /// a name can never climb out of the state directory.
    pub fn new(cwd: impl AsRef<Path>, team_name: &str) -> Result<Self> {
        let clean = sanitize_name(team_name)?;
        if clean != team_name {
            return Err(crate::Error::InvalidName {
                name: team_name.to_string(),
                reason: format!("must already be sanitized (expected \"{}\")", clean),
            });
        }
        let cwd = cwd.as_ref().to_path_buf();
        let root = cwd.join(STATE_SUBDIR).join(team_name);
        Ok(Self {
            team_name: team_name.to_string(),
            cwd,
            root,
        })
    }

    pub fn team_name(&self) -> &str {
        &self.team_name
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn session(&self) -> PathBuf {
        self.root.join("session.json")
    }

    pub fn shutdown(&self) -> PathBuf {
        self.root.join("shutdown.json")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    pub fn worker_dir(&self, worker: &str) -> PathBuf {
        self.workers_dir().join(worker)
    }

    pub fn heartbeat(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("heartbeat.json")
    }

    pub fn inbox(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("inbox.jsonl")
    }

    pub fn inbox_cursor(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("inbox.offset")
    }

    pub fn outbox(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("outbox.jsonl")
    }

    pub fn outbox_cursor(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("outbox.offset")
    }

    pub fn done(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("done.json")
    }

    pub fn shutdown_ack(&self, worker: &str) -> PathBuf {
        self.worker_dir(worker).join("shutdown-ack.json")
    }

    /// Path as a worker sees it from the shared working directory.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.cwd)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Derived worker name for the zero-based index `i`.
pub fn worker_name(index: usize) -> String {
    format!("worker-{}", index + 1)
}
