//! Job persistence: an in-memory map mirrored to one JSON file per job.
//!
//! ```text
//! <jobs dir>/<id>.json          job record
//! <jobs dir>/<id>-panes.json    pane ids written by the runtime
//! <jobs dir>/<id>.stdout        runtime summary
//! <jobs dir>/<id>.stderr        runtime log trail
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::model::{Job, JobId, JobStatus, PaneRecord};
use crate::util::{read_json_safe, write_json_atomic};
use crate::{clog_debug, clog_warn, Result};

/// Storage contract for jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace.
    async fn save(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }
}

/// `<dir>/<id>.json` plus the runtime's `<dir>/<id>-panes.json`.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn panes_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}-panes.json", id))
    }

    /// Where the runtime's stdout is captured.
    pub fn stdout_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.stdout", id))
    }

    pub fn stderr_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.stderr", id))
    }

    pub async fn write_panes(&self, id: &JobId, record: &PaneRecord) -> Result<()> {
        write_json_atomic(&self.panes_path(id), record).await
    }

    pub async fn read_panes(&self, id: &JobId) -> Option<PaneRecord> {
        read_json_safe(&self.panes_path(id)).await
    }
}

#[async_trait]
impl JobRepository for FileJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        write_json_atomic(&self.job_path(&job.job_id), job).await
    }

    /// A torn or foreign file reads as absent.
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(read_json_safe::<Job>(&self.job_path(id))
            .await
            .filter(|job| &job.job_id == id))
    }
}

/// Read-through registry: memory first, then disk. Every write goes to
/// both, and all mutations of one manager are serialized.
pub struct JobRegistry {
    memory: Box<dyn JobRepository>,
    disk: FileJobStore,
    write_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: Box::new(MemoryJobStore::new()),
            disk: FileJobStore::new(jobs_dir),
            write_lock: Mutex::new(()),
        }
    }

    pub fn files(&self) -> &FileJobStore {
        &self.disk
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        if let Some(job) = self.memory.find_by_id(id).await? {
            return Ok(Some(job));
        }
        let found = self.disk.find_by_id(id).await?;
        if found.is_some() {
            clog_debug!("job {} loaded from disk", id);
        }
        Ok(found)
    }

    /// Memory is updated even when the disk write fails; the failure is
    /// still reported.
    pub async fn save(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.persist(job).await
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        self.memory.save(job).await?;
        self.disk.save(job).await
    }

    /// Read-modify-write of one job. `None` when the job is unknown.
    pub async fn update<F>(&self, id: &JobId, f: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let Some(mut job) = self.get(id).await? else {
            return Ok(None);
        };
        f(&mut job);
        if let Err(e) = self.persist(&job).await {
            clog_warn!("job {} not persisted: {}", id, e);
        }
        Ok(Some(job))
    }

    /// Terminal transition, applied only while the job is still running.
    /// `f` runs in either case and may record output. Returns whether the
    /// status changed.
    pub async fn finish<F>(&self, id: &JobId, status: JobStatus, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut changed = false;
        self.update(id, |job| {
            changed = job.finish(status);
            f(job);
        })
        .await?;
        Ok(changed)
    }
}
