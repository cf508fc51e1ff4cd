//! Command Bus, host side.
//!
//! Agents write commands into their group's namespace; the host scans every
//! namespace on a fixed interval, authorizes each document against the
//! directory it was found in, applies it, and deletes it. Rejected documents
//! are moved to a quarantine directory with a record of why. Delivery is
//! at-most-once.

mod authz;
mod bus;
mod layout;
mod quarantine;
mod snapshots;

pub use authz::{Rejection, check_admin, check_source, check_target, check_task_owner};
pub use bus::{BusSettings, CommandBus, ScanReport};
pub use layout::{
    ERRORS_DIR, GROUPS_SNAPSHOT, INPUT_DIR, IpcLayout, MESSAGES_DIR, TASKS_DIR, TASKS_SNAPSHOT,
};
pub use quarantine::{QuarantineRecord, quarantine};
pub use snapshots::{AvailableGroups, GroupSnapshot, TaskSnapshot};

use crate::storage::DatabaseError;

/// Failures that stop a scan.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] nestbox_core::Error),
}
