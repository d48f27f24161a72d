//! Orchestration layer: drives worker panes, watches for completions and
//! tracks team health.

pub mod health;
pub mod pane;
pub mod runtime;
pub mod supervisor;
pub mod team;
pub mod watchdog;

pub use health::{HealthMonitor, Phase, TeamSnapshot, WorkerState};
pub use pane::{PanePatterns, PaneState};
pub use runtime::{Runtime, RuntimeInput, RuntimeReport};
pub use supervisor::{Supervisor, TeamSession, WorkerSpawn};
pub use team::{LaunchedTeam, Team, TeamConfig, TeamLauncher, WorkerInfo};
pub use watchdog::{CompletionEvent, CompletionHandler, Watchdog, WatchdogHandle};
