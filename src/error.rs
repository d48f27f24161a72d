use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error(
        "tmux is not available. Install it:\n  macOS: brew install tmux\n  Ubuntu/Debian: sudo apt-get install tmux\n  Fedora: sudo dnf install tmux\n  Arch: sudo pacman -S tmux"
    )]
    TmuxNotFound,

    #[error("Team mode requires running inside tmux. Start one: tmux new-session")]
    NotInsideTmux,

    #[error("Invalid name \"{name}\": {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Unknown agent type: {0}. Supported: claude, codex, gemini")]
    UnknownAgentKind(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Invalid job_id: \"{0}\". Must match ^crew-[a-z0-9]{{1,12}}$")]
    InvalidJobId(String),

    #[error("No job found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is still running")]
    JobStillRunning(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
