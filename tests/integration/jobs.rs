//! Job manager integration tests. The runtime is replaced by small shell
//! scripts so every outcome can be forced.

#![cfg(unix)]

use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use crew::job::{Job, JobId, JobManager, JobStatus, PaneRecord, RuntimeCommand};
use crew::orchestration::TeamConfig;
use crew::Error;

use crate::fixtures::{eventually, supervisor, team_config, FakeMux, LEADER};

fn script(body: &str) -> RuntimeCommand {
    RuntimeCommand::new("sh", &["-c", body])
}

fn manager(jobs: &TempDir, body: &str) -> JobManager {
    JobManager::new(jobs.path(), script(body)).with_terminate_grace(Duration::from_millis(500))
}

fn config(cwd: &TempDir) -> TeamConfig {
    team_config(cwd.path(), "job-team", 1, 1)
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Test: Summary on stdout
/// Given a runtime that prints a completed summary
/// When the job is waited on
/// Then the job is completed and the summary comes back structured
#[tokio::test]
async fn test_job_completes_from_stdout_summary() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let manager = manager(
        &jobs,
        r#"cat >/dev/null; echo '{"status":"completed","teamName":"job-team"}'"#,
    );

    let started = manager.start(&config(&cwd)).await.unwrap();
    assert!(started.pid.is_some());
    assert!(started.message.contains(&started.job_id));
    let id = JobId::parse(&started.job_id).unwrap();

    let report = manager.wait(&id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.result.unwrap()["teamName"], "job-team");
    assert!(report.error.is_none());

    let job = manager.registry().get(&id).await.unwrap().unwrap();
    assert!(job.finished_at.is_some());
    assert_eq!(job.team_name.as_deref(), Some("job-team"));
}

/// Test: Exit code fallback
/// Given a runtime that prints nothing and exits non-zero
/// When the job is waited on
/// Then it fails and keeps the stderr trail
#[tokio::test]
async fn test_job_fails_on_exit_code_with_stderr() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let manager = manager(&jobs, "echo boom >&2; exit 3");

    let started = manager.start(&config(&cwd)).await.unwrap();
    let id = JobId::parse(&started.job_id).unwrap();
    let report = manager.wait(&id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.stderr.as_deref(), Some("boom"));
    assert!(report.result.is_none());
}

/// Test: Runtime input
/// Given a runtime that copies its stdin next to the job files
/// When the job runs
/// Then it received the team config and its job identity
#[tokio::test]
async fn test_runtime_receives_config_and_identity() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let manager = manager(&jobs, r#"cat > "$CREW_JOBS_DIR/$CREW_JOB_ID.input""#);

    let started = manager.start(&config(&cwd)).await.unwrap();
    let id = JobId::parse(&started.job_id).unwrap();
    let report = manager.wait(&id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let raw = std::fs::read_to_string(jobs.path().join(format!("{}.input", id))).unwrap();
    let input: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(input["teamName"], "job-team");
    assert_eq!(input["workerCount"], 1);
    assert_eq!(input["tasks"][0]["subject"], "Task 1");
}

/// Test: Wait timeout
/// Given a runtime that never finishes
/// When wait runs out of time
/// Then the job is timed out, its process is stopped and the late exit does
/// not overwrite the outcome
#[tokio::test]
async fn test_wait_timeout_stops_runtime() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let manager = manager(&jobs, "exec sleep 30");

    let started = manager.start(&config(&cwd)).await.unwrap();
    let id = JobId::parse(&started.job_id).unwrap();
    let pid = started.pid.unwrap();

    let report = manager.wait(&id, Some(Duration::from_millis(300))).await.unwrap();
    assert_eq!(report.status, JobStatus::Timeout);
    let error = report.error.unwrap();
    assert!(error.starts_with(&format!("Timed out waiting for job {}", id)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!crew::job::process::is_alive(pid));
    let after = manager.status(&id).await.unwrap();
    assert_eq!(after.status, JobStatus::Timeout);
}

/// Test: Timeout seen by another manager
/// Given a runtime started by one manager that logs to stderr and hangs
/// When a second manager, as a separate `crew wait` would, times out on it
/// Then the timeout report still carries the stderr trail
#[tokio::test]
async fn test_timeout_from_detached_manager_keeps_stderr() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let owner = manager(&jobs, "echo progress-log >&2; exec sleep 30");
    let started = owner.start(&config(&cwd)).await.unwrap();
    let id = JobId::parse(&started.job_id).unwrap();

    let stderr_path = owner.registry().files().stderr_path(&id);
    let logged = eventually(Duration::from_secs(3), || {
        let path = stderr_path.clone();
        async move { std::fs::read_to_string(path).map_or(false, |s| s.contains("progress-log")) }
    })
    .await;
    assert!(logged);

    let waiter = manager(&jobs, "true");
    let report = waiter.wait(&id, Some(Duration::from_millis(300))).await.unwrap();
    assert_eq!(report.status, JobStatus::Timeout);
    assert_eq!(report.stderr.as_deref(), Some("progress-log"));
    assert!(report.error.is_some());
}

/// Test: Orphaned job with a stderr trail
/// Given a running job whose runtime died on a precondition, leaving only stderr
/// When its status is read
/// Then it is failed and the stderr explains why
#[tokio::test]
async fn test_orphaned_job_keeps_stderr() {
    let jobs = TempDir::new().unwrap();
    let manager = manager(&jobs, "true");
    let mut job = Job::new(JobId::parse("crew-notmux").unwrap());
    job.pid = Some(dead_pid());
    manager.registry().save(&job).await.unwrap();
    std::fs::write(
        manager.registry().files().stderr_path(&job.job_id),
        "crew runtime: Not running inside a tmux session\n",
    )
    .unwrap();

    let report = manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(
        report.stderr.as_deref(),
        Some("crew runtime: Not running inside a tmux session")
    );
    assert!(report.error.unwrap().contains("no longer alive"));
}

/// Test: Orphaned job
/// Given a running job record whose process is gone and left no output
/// When a fresh manager looks at it
/// Then the job is failed with an explanation
#[tokio::test]
async fn test_orphaned_job_is_failed() {
    let jobs = TempDir::new().unwrap();
    let manager = manager(&jobs, "true");
    let mut job = Job::new(JobId::parse("crew-orphan1").unwrap());
    job.pid = Some(dead_pid());
    manager.registry().save(&job).await.unwrap();

    let report = manager.wait(&job.job_id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.error.unwrap().contains("no longer alive"));

    // a second look reports the settled state without a fresh error
    let again = manager.status(&job.job_id).await.unwrap();
    assert_eq!(again.status, JobStatus::Failed);
    assert!(again.error.is_none());
}

/// Test: Detached completion
/// Given a running job record whose process exited after printing a summary
/// When its status is read by a manager that did not spawn it
/// Then the summary settles the outcome
#[tokio::test]
async fn test_detached_job_settles_from_output() {
    let jobs = TempDir::new().unwrap();
    let manager = manager(&jobs, "true");
    let mut job = Job::new(JobId::parse("crew-detached1").unwrap());
    job.pid = Some(dead_pid());
    manager.registry().save(&job).await.unwrap();
    let files = manager.registry().files();
    std::fs::write(files.stdout_path(&job.job_id), "{\"status\":\"completed\"}\n").unwrap();

    let report = manager.status(&job.job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.result.unwrap()["status"], "completed");
}

/// Test: Unknown job
/// Given an id nobody started
/// When it is queried
/// Then the manager reports it as not found
#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let jobs = TempDir::new().unwrap();
    let manager = manager(&jobs, "true");
    let id = JobId::parse("crew-nobody").unwrap();
    assert!(matches!(manager.status(&id).await, Err(Error::JobNotFound(_))));
    assert!(matches!(manager.wait(&id, None).await, Err(Error::JobNotFound(_))));
    assert!(matches!(manager.cleanup(&id, None).await, Err(Error::JobNotFound(_))));
}

/// Test: Cleanup rules
/// Given a running job, a finished job without panes and a finished job with
/// a pane file
/// When each is cleaned up
/// Then the running one is refused, the bare one is a no-op, and only the
/// worker panes of the last are killed
#[tokio::test]
async fn test_cleanup_kills_only_worker_panes() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let manager = manager(&jobs, "true").with_supervisor(supervisor(mux.clone()));

    let mut running = Job::new(JobId::parse("crew-busy").unwrap());
    running.pid = Some(std::process::id());
    manager.registry().save(&running).await.unwrap();
    assert!(matches!(
        manager.cleanup(&running.job_id, None).await,
        Err(Error::JobStillRunning(_))
    ));

    let mut bare = Job::new(JobId::parse("crew-bare").unwrap());
    bare.finish(JobStatus::Completed);
    manager.registry().save(&bare).await.unwrap();
    let report = manager.cleanup(&bare.job_id, None).await.unwrap();
    assert_eq!(report.panes_killed, 0);
    assert!(report.message.contains("nothing to clean up"));

    let mut done = Job::new(JobId::parse("crew-done").unwrap());
    done.team_name = Some("job-team".to_string());
    done.cwd = Some(cwd.path().to_path_buf());
    done.finish(JobStatus::Failed);
    manager.registry().save(&done).await.unwrap();
    let record = PaneRecord {
        pane_ids: vec!["%1".to_string(), "%2".to_string(), LEADER.to_string()],
        leader_pane_id: Some(LEADER.to_string()),
        session_name: None,
    };
    manager
        .registry()
        .files()
        .write_panes(&done.job_id, &record)
        .await
        .unwrap();

    let report = manager.cleanup(&done.job_id, Some(Duration::ZERO)).await.unwrap();
    assert_eq!(report.panes_killed, 2);
    assert_eq!(report.message, "Cleaned up 2 worker pane(s).");
    assert_eq!(mux.killed_panes(), vec!["%1", "%2"]);
    assert!(cwd
        .path()
        .join(".crew/state/team/job-team/shutdown.json")
        .exists());

    let job = manager.registry().get(&done.job_id).await.unwrap().unwrap();
    assert!(job.cleaned_up_at.is_some());
    assert_eq!(job.status, JobStatus::Failed);
}

/// Test: Spawn failure
/// Given a runtime binary that does not exist
/// When a job is started
/// Then no pid is returned and the job is recorded as failed
#[tokio::test]
async fn test_spawn_failure_is_recorded() {
    let jobs = TempDir::new().unwrap();
    let cwd = TempDir::new().unwrap();
    let manager = JobManager::new(
        jobs.path(),
        RuntimeCommand::new("/nonexistent/crew-runtime", &["runtime"]),
    );

    let started = manager.start(&config(&cwd)).await.unwrap();
    assert!(started.pid.is_none());
    let id = JobId::parse(&started.job_id).unwrap();
    let report = manager.status(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.stderr.unwrap().starts_with("spawn error:"));
}
