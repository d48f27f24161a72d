//! Ledger and mailbox integration tests against real files.

use tempfile::TempDir;

use crew::core::ledger::{NewTask, TaskLedger, TaskStatus, TaskUpdate};
use crew::core::mailbox::{InboxKind, InboxMessage, Mailbox};
use crew::paths::TeamPaths;

fn blocked(subject: &str, blockers: &[&str]) -> NewTask {
    NewTask {
        blocked_by: blockers.iter().map(|b| b.to_string()).collect(),
        ..NewTask::new(subject, "")
    }
}

/// Test: Blockers gate claiming
/// Given a chain 1 <- 2 <- 3 plus an independent task 4
/// When workers claim before and after finishing their tasks
/// Then no claimed task ever has an unfinished blocker
#[tokio::test]
async fn test_claims_follow_dependency_order() {
    let dir = TempDir::new().unwrap();
    let ledger = TaskLedger::new(dir.path().join("tasks"));
    ledger.create_task(NewTask::new("schema", "")).await.unwrap();
    ledger.create_task(blocked("api", &["1"])).await.unwrap();
    ledger.create_task(blocked("ui", &["2"])).await.unwrap();
    ledger.create_task(NewTask::new("docs", "")).await.unwrap();

    let first = ledger.claim_next("worker-1").await.unwrap().unwrap();
    let second = ledger.claim_next("worker-2").await.unwrap().unwrap();
    assert_eq!((first.id.as_str(), second.id.as_str()), ("1", "4"));
    assert_eq!(second.owner.as_deref(), Some("worker-2"));
    assert!(ledger.claim_next("worker-3").await.unwrap().is_none());

    let mut order = Vec::new();
    let mut current = first;
    loop {
        ledger
            .update_task(
                &current.id,
                TaskUpdate::default().status(TaskStatus::Completed).completed_now(),
            )
            .await
            .unwrap();
        let Some(next) = ledger.claim_next("worker-1").await.unwrap() else {
            break;
        };
        assert!(ledger.are_blockers_resolved(&next.blocked_by).await);
        order.push(next.id.clone());
        current = next;
    }
    assert_eq!(order, vec!["2", "3"]);
}

/// Test: Failed blocker
/// Given task 2 blocked by task 1
/// When task 1 fails
/// Then task 2 is never offered
#[tokio::test]
async fn test_failed_blocker_keeps_dependent_waiting() {
    let dir = TempDir::new().unwrap();
    let ledger = TaskLedger::new(dir.path());
    ledger.create_task(NewTask::new("build", "")).await.unwrap();
    ledger.create_task(blocked("ship", &["1"])).await.unwrap();

    ledger
        .update_task("1", TaskUpdate::default().status(TaskStatus::Failed).owner(Some("worker-1")))
        .await
        .unwrap();
    assert!(ledger.find_next_claimable("worker-2").await.unwrap().is_none());
    assert!(!ledger.are_blockers_resolved(&["1".to_string(), "9".to_string()]).await);
}

fn inbox_for(dir: &TempDir) -> crew::core::mailbox::JsonlLog<InboxMessage> {
    let paths = TeamPaths::new(dir.path(), "mail-team").unwrap();
    Mailbox::new(paths).inbox("worker-1")
}

/// Test: Cursor consumption
/// Given N appended messages
/// When the inbox is read twice
/// Then the first read returns all N and the second none
#[tokio::test]
async fn test_inbox_read_new_consumes_once() {
    let dir = TempDir::new().unwrap();
    let inbox = inbox_for(&dir);
    for i in 0..5 {
        inbox
            .append(&InboxMessage::new(InboxKind::Message, format!("note {}", i)))
            .unwrap();
    }

    let first = inbox.read_new().unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first[4].content, "note 4");
    assert!(inbox.read_new().unwrap().is_empty());
    assert_eq!(inbox.read_all().unwrap().len(), 5);
}

/// Test: Rotation
/// Given an inbox over its line bound
/// When it is rotated
/// Then the newest half survives and unread messages are still delivered
#[tokio::test]
async fn test_inbox_rotation_keeps_newest_half() {
    let dir = TempDir::new().unwrap();
    let inbox = inbox_for(&dir);
    for i in 0..10 {
        inbox
            .append(&InboxMessage::new(InboxKind::Message, format!("m{}", i)))
            .unwrap();
    }
    assert!(!inbox.rotate_if_exceeds(10).unwrap());
    assert!(inbox.rotate_if_exceeds(8).unwrap());

    let kept = inbox.read_all().unwrap();
    let contents: Vec<_> = kept.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m6", "m7", "m8", "m9"]);
    assert_eq!(inbox.read_new().unwrap().len(), 4);

    inbox.clear().unwrap();
    assert_eq!(inbox.cursor(), 0);
    assert!(inbox.read_all().unwrap().is_empty());
}
