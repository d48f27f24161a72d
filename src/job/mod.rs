//! Background jobs: one detached runtime process per team.

pub mod manager;
pub mod model;
pub mod process;
pub mod store;

pub use manager::{JobManager, RuntimeCommand};
pub use model::{CleanupReport, Job, JobId, JobReport, JobStarted, JobStatus, PaneRecord};
pub use store::{FileJobStore, JobRegistry, JobRepository, MemoryJobStore};

/// Set on the runtime child: the job it runs for.
pub const JOB_ID_ENV: &str = "CREW_JOB_ID";
/// Set on the runtime child: where job files live.
pub const JOBS_DIR_ENV: &str = "CREW_JOBS_DIR";
