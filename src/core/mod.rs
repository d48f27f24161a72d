//! Shared file-backed state of a team: the task ledger and the worker
//! mailboxes.

pub mod ledger;
pub mod mailbox;

pub use ledger::{NewTask, TaskCounts, TaskLedger, TaskRecord, TaskStatus, TaskUpdate};
pub use mailbox::{InboxMessage, JsonlLog, Mailbox, OutboxMessage};
