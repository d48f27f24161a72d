//! crew: run a team of worker CLI agents in tmux panes and track the team
//! as a background job.
//!
//! Workers are driven only through the filesystem and typed text. The task
//! ledger and mailboxes live under `<cwd>/.crew/state/team/<team>/`; jobs
//! live under the jobs directory (see [`config::Config::jobs_dir`]).

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod log;
pub mod orchestration;
pub mod paths;
pub mod tmux;
pub mod util;

pub use error::{Error, Result};
