//! Team lifecycle integration tests on a scripted multiplexer.

use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crew::config::Config;
use crew::core::ledger::TaskStatus;
use crew::core::mailbox::{AckStatus, DoneSignal, DoneStatus, InboxKind, ShutdownAck};
use crew::job::{FileJobStore, JobId, JobStatus};
use crew::orchestration::runtime::{JobContext, Runtime};
use crew::orchestration::{Phase, TeamLauncher};

use crate::fixtures::{
    eventually, fast_settings, launcher, supervisor, team_config, FakeMux, LEADER, WINDOW,
};

fn done(task_id: &str, status: DoneStatus) -> DoneSignal {
    DoneSignal {
        task_id: task_id.to_string(),
        status,
        summary: format!("finished {}", task_id),
        completed_at: Utc::now(),
    }
}

/// Test: End-to-end completion
/// Given a team of 2 workers and 2 tasks
/// When each worker writes a completed done file
/// Then both tasks complete, the sentinels are consumed and the phase is completed
#[tokio::test]
async fn test_team_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let team = launcher(mux.clone())
        .start(team_config(dir.path(), "e2e-team", 2, 2))
        .await
        .unwrap();

    assert_eq!(team.workers().len(), 2);
    for task in team.ledger().list_tasks().await.unwrap() {
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.owner.is_none());
    }
    assert_eq!(team.snapshot().await.unwrap().phase, Phase::Planning);

    let mailbox = team.mailbox().clone();
    mailbox.write_done("worker-1", &done("1", DoneStatus::Completed)).await.unwrap();
    mailbox.write_done("worker-2", &done("2", DoneStatus::Completed)).await.unwrap();

    let ledger = team.ledger().clone();
    let settled = eventually(Duration::from_secs(3), || {
        let ledger = ledger.clone();
        async move {
            let counts = ledger.counts().await.unwrap();
            counts.completed == 2
        }
    })
    .await;
    assert!(settled, "watchdog never applied both completions");

    assert!(mailbox.read_done("worker-1").await.is_none());
    assert!(mailbox.read_done("worker-2").await.is_none());
    let task = team.ledger().read_task("2").await.unwrap();
    assert_eq!(task.result.as_deref(), Some("finished 2"));
    assert!(task.completed_at.is_some());
    assert_eq!(team.snapshot().await.unwrap().phase, Phase::Completed);

    // the leader hears about each completion
    let notes = mux.typed(LEADER);
    assert!(notes.iter().any(|n| n.starts_with("[CREW_INJECT]") && n.contains("worker-1")));

    let root = team.paths().root().to_path_buf();
    team.shutdown(Duration::ZERO).await.unwrap();
    assert!(!root.exists());
}

/// Test: Initial delivery
/// Given a team with more workers than tasks
/// When the team starts
/// Then worker n gets task n in its inbox plus a trigger, and the extra worker only a welcome
#[tokio::test]
async fn test_initial_tasks_delivered_by_position() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let team = launcher(mux.clone())
        .start(team_config(dir.path(), "deliver", 2, 1))
        .await
        .unwrap();

    let first = team.mailbox().inbox("worker-1").read_all().unwrap();
    assert_eq!(first[0].kind, InboxKind::Context);
    assert_eq!(first[1].kind, InboxKind::Task);
    assert!(first[1].content.contains("Task ID: 1"));
    assert!(first[1].content.contains("workers/worker-1/done.json"));

    let second = team.mailbox().inbox("worker-2").read_all().unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].kind, InboxKind::Context);

    let pane = &team.workers()[0].pane_id;
    let typed = mux.typed(pane);
    assert!(typed[0].contains("exec claude --dangerously-skip-permissions"));
    assert!(typed[0].contains("CREW_TEAM_WORKER=deliver/worker-1"));
    assert!(typed
        .iter()
        .any(|t| t.starts_with("Read and execute your task from: .crew/state/team/deliver/workers/worker-1/inbox.jsonl")));

    team.shutdown(Duration::ZERO).await.unwrap();
}

/// Test: Dynamic assignment
/// Given a running team
/// When another task is assigned to a worker that already finished one
/// Then the ledger, the inbox and the pane all see it and the worker is watched again
#[tokio::test]
async fn test_assign_task_rearms_watchdog() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let team = launcher(mux.clone())
        .start(team_config(dir.path(), "assign", 1, 2))
        .await
        .unwrap();
    let mailbox = team.mailbox().clone();
    let ledger = team.ledger().clone();

    mailbox.write_done("worker-1", &done("1", DoneStatus::Completed)).await.unwrap();
    let first_done = eventually(Duration::from_secs(3), || {
        let ledger = ledger.clone();
        async move { ledger.read_task("1").await.map(|t| t.status) == Some(TaskStatus::Completed) }
    })
    .await;
    assert!(first_done);

    team.assign_task("2", "worker-1").await.unwrap();
    let task = ledger.read_task("2").await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.owner.as_deref(), Some("worker-1"));
    assert!(task.extra.contains_key("assignedAt"));
    assert!(mux.typed(&team.workers()[0].pane_id).contains(&"new-task:2".to_string()));

    mailbox.write_done("worker-1", &done("2", DoneStatus::Failed)).await.unwrap();
    let second_done = eventually(Duration::from_secs(3), || {
        let ledger = ledger.clone();
        async move { ledger.read_task("2").await.map(|t| t.status) == Some(TaskStatus::Failed) }
    })
    .await;
    assert!(second_done);
    let failure = ledger.read_task_failure("2").await.unwrap();
    assert_eq!(failure.last_error, "finished 2");
    assert_eq!(team.snapshot().await.unwrap().phase, Phase::Fixing);

    assert!(team.assign_task("1", "worker-9").await.is_err());
    team.shutdown(Duration::ZERO).await.unwrap();
}

/// Test: All workers dead
/// Given a team with outstanding tasks
/// When every worker pane dies
/// Then the snapshot reports a failure condition and the runtime ends as failed
#[tokio::test]
async fn test_all_dead_workers_fail_the_runtime() {
    let dir = TempDir::new().unwrap();
    let jobs = TempDir::new().unwrap();
    let mux = FakeMux::new();

    let team = launcher(mux.clone())
        .start(team_config(dir.path(), "doomed", 2, 2))
        .await
        .unwrap();
    for worker in team.workers() {
        mux.set_dead(&worker.pane_id);
    }
    let snapshot = team.snapshot().await.unwrap();
    assert_eq!(snapshot.live_workers(), 0);
    assert_eq!(snapshot.dead_workers, vec!["worker-1", "worker-2"]);
    assert!(snapshot.failure_condition().unwrap().contains("all workers dead"));
    team.shutdown(Duration::ZERO).await.unwrap();

    // the same situation inside the runtime loop
    let job_id = JobId::parse("crew-rt1").unwrap();
    let files = FileJobStore::new(jobs.path());
    let runtime = Runtime::new(launcher(mux.clone()), &fast_settings())
        .with_poll_interval(Duration::from_millis(10))
        .with_job(Some(JobContext {
            job_id: job_id.clone(),
            files: files.clone(),
        }));

    let killer = {
        let mux = mux.clone();
        let files = files.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            for _ in 0..300 {
                if let Some(record) = files.read_panes(&job_id).await {
                    for pane in &record.pane_ids {
                        mux.set_dead(pane);
                    }
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("pane file never written");
        })
    };

    let report = runtime
        .run(team_config(dir.path(), "doomed", 2, 2), CancellationToken::new())
        .await
        .unwrap();
    let record = killer.await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.worker_count, 2);
    assert_eq!(report.task_results.len(), 2);
    assert_eq!(record.leader_pane_id.as_deref(), Some(LEADER));
}

/// Test: Interrupted runtime
/// Given a running team
/// When the runtime is cancelled
/// Then it shuts the team down and reports failed
#[tokio::test]
async fn test_cancelled_runtime_reports_failed() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let runtime = Runtime::new(launcher(mux.clone()), &fast_settings())
        .with_poll_interval(Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = runtime
        .run(team_config(dir.path(), "stopped", 1, 1), cancel)
        .await
        .unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.task_results[0].status, TaskStatus::Pending);
    assert!(!dir.path().join(".crew/state/team/stopped").exists());
}

/// Test: Stop during startup
/// Given workers that take two seconds to boot
/// When the runtime is cancelled while still waiting on them
/// Then the pane file already lists the workers and their panes are torn down
#[tokio::test]
async fn test_cancel_during_startup_tears_down_panes() {
    let dir = TempDir::new().unwrap();
    let jobs = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let settings = Config {
        worker_startup_delay_ms: 2_000,
        ..fast_settings()
    };
    let launcher = TeamLauncher::new(supervisor(mux.clone()), settings.clone()).verify_agents(false);
    let job_id = JobId::parse("crew-early1").unwrap();
    let files = FileJobStore::new(jobs.path());
    let runtime = Runtime::new(launcher, &settings)
        .with_poll_interval(Duration::from_secs(60))
        .with_job(Some(JobContext {
            job_id: job_id.clone(),
            files: files.clone(),
        }));
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        let files = files.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let record = files.read_panes(&job_id).await;
            cancel.cancel();
            record
        })
    };

    let started = tokio::time::Instant::now();
    let report = runtime
        .run(team_config(dir.path(), "early", 2, 2), cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(report.status, JobStatus::Failed);

    let record = trigger.await.unwrap().expect("pane file written before delivery");
    assert_eq!(record.pane_ids.len(), 2);
    assert_eq!(mux.killed_panes(), record.pane_ids);
    assert!(mux.killed_sessions().is_empty());
    assert!(!dir.path().join(".crew/state/team/early").exists());
}

/// Test: Bounded inbox
/// Given a team whose inboxes keep at most four lines
/// When a worker is assigned more tasks than fit
/// Then the oldest messages are dropped and the newest assignment survives
#[tokio::test]
async fn test_assignments_rotate_the_inbox() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let settings = Config {
        max_inbox_lines: 4,
        ..fast_settings()
    };
    let team = TeamLauncher::new(supervisor(mux.clone()), settings)
        .verify_agents(false)
        .start(team_config(dir.path(), "busy", 1, 4))
        .await
        .unwrap();
    let inbox = team.mailbox().inbox("worker-1");
    assert_eq!(inbox.read_all().unwrap().len(), 2);

    for task in ["2", "3", "4"] {
        team.assign_task(task, "worker-1").await.unwrap();
    }
    let kept = inbox.read_all().unwrap();
    assert_eq!(kept.len(), 2);
    assert!(kept.iter().all(|m| m.kind == InboxKind::Task));
    assert!(kept[1].content.contains("Task ID: 4"));
    team.shutdown(Duration::ZERO).await.unwrap();
}

/// Test: Shutdown handshake
/// Given every worker acknowledges the shutdown
/// When the team shuts down with a long ack timeout
/// Then it does not wait out the timeout and still removes the worker panes
#[tokio::test]
async fn test_shutdown_returns_once_all_acked() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let team = launcher(mux.clone())
        .start(team_config(dir.path(), "acked", 2, 1))
        .await
        .unwrap();

    let ack = ShutdownAck {
        status: AckStatus::Accept,
        reason: None,
        updated_at: Utc::now(),
    };
    for worker in team.workers() {
        team.mailbox().write_shutdown_ack(&worker.name, &ack).await.unwrap();
    }
    assert_eq!(team.mailbox().read_shutdown_ack("worker-2").await, Some(ack));
    let panes = team.session().worker_pane_ids.clone();

    let started = std::time::Instant::now();
    team.shutdown(Duration::from_secs(10)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(mux.killed_panes(), panes);
}

/// Test: Embedded teardown
/// Given a team split into someone else's window
/// When it is torn down
/// Then only worker panes die; never the session, never the leader
#[tokio::test]
async fn test_teardown_of_split_window_spares_leader() {
    let mux = FakeMux::new();
    let supervisor = supervisor(mux.clone());
    let panes = vec!["%1".to_string(), LEADER.to_string(), "%2".to_string()];

    supervisor.teardown(WINDOW, &panes, Some(LEADER)).await;
    assert_eq!(mux.killed_panes(), vec!["%1", "%2"]);
    assert!(mux.killed_sessions().is_empty());

    supervisor.teardown("crew-team-own", &panes, Some(LEADER)).await;
    assert_eq!(mux.killed_sessions(), vec!["crew-team-own"]);
    assert!(!mux.killed_panes().contains(&LEADER.to_string()));
}

/// Test: Resume
/// Given a started team whose second worker died
/// When the team is resumed from its files
/// Then only the live worker comes back
#[tokio::test]
async fn test_resume_keeps_live_workers() {
    let dir = TempDir::new().unwrap();
    let mux = FakeMux::new();
    let launcher = launcher(mux.clone());
    let mut team = launcher
        .start(team_config(dir.path(), "resumable", 2, 2))
        .await
        .unwrap();
    team.stop_watchdog().await;
    let dead = team.workers()[1].pane_id.clone();
    mux.set_dead(&dead);

    let resumed = launcher
        .resume("resumable", dir.path())
        .await
        .unwrap()
        .expect("team should resume");
    assert_eq!(resumed.workers().len(), 1);
    assert_eq!(resumed.workers()[0].name, "worker-1");
    assert!(!resumed.session().worker_pane_ids.contains(&dead));

    assert!(launcher.resume("never-started", dir.path()).await.unwrap().is_none());
    resumed.shutdown(Duration::ZERO).await.unwrap();
}
