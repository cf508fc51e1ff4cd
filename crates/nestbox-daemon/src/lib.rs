//! Nestbox Daemon Library
//!
//! Host side of Nestbox:
//! - Orchestrator control loop with per-group cursors and rollback
//! - Execution Queue with per-group ordering and a global limit
//! - Container Runner with swappable sandbox backends
//! - Command Bus scanner with authorization and quarantine
//! - SQLite storage for messages, groups, cursors and tasks
//! - Transport adapters and the scheduled task runner

pub mod channel;
pub mod groups;
pub mod ipc;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod storage;
