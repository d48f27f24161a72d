//! Integration test suite for crew.
//!
//! # Test Categories
//!
//! - `state_files`: ledger and mailbox behaviour on real files
//! - `team_lifecycle`: team start, completion, failure and teardown
//! - `jobs`: job start, status, wait and cleanup with real child processes
//!
//! # CI Compatibility
//!
//! tmux is replaced by a scripted multiplexer and worker CLIs are never
//! launched, so these tests run without either installed.

mod fixtures;

mod jobs;
mod state_files;
mod team_lifecycle;
