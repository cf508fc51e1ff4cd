//! Authorization rules for Command Bus documents.
//!
//! Every check is a pure function so the rules can be tested without a
//! filesystem or a store.

use nestbox_core::ipc::CommandPayload;

/// Why a document was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("sourceGroup '{claimed}' does not match directory '{directory}'")]
    SourceMismatch { claimed: String, directory: String },

    #[error("{kind} is restricted to the administrative group (source '{source_group}')")]
    AdminOnly {
        kind: &'static str,
        source_group: String,
    },

    #[error("task {task_id} belongs to '{owner}', not '{source_group}'")]
    NotTaskOwner {
        task_id: String,
        owner: String,
        source_group: String,
    },

    #[error("'{source_group}' may not target {chat_jid}")]
    ForeignTarget {
        source_group: String,
        chat_jid: String,
    },

    #[error("group '{0}' is not registered")]
    UnknownGroup(String),

    #[error("{0} is not a registered conversation")]
    UnknownTarget(String),

    #[error("folder '{0}' is reserved")]
    ReservedFolder(String),
}

impl Rejection {
    /// `malformed` or `unauthorized`, recorded with quarantined files.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::ReservedFolder(_) => "malformed",
            _ => "unauthorized",
        }
    }
}

/// The claimed source must be the directory the file was found in.
pub fn check_source(directory: &str, claimed: &str) -> Result<(), Rejection> {
    if directory == claimed {
        Ok(())
    } else {
        Err(Rejection::SourceMismatch {
            claimed: claimed.to_string(),
            directory: directory.to_string(),
        })
    }
}

/// Administrative commands need the administrative source.
pub fn check_admin(payload: &CommandPayload, source: &str, admin: &str) -> Result<(), Rejection> {
    if payload.requires_admin() && source != admin {
        return Err(Rejection::AdminOnly {
            kind: payload.kind(),
            source_group: source.to_string(),
        });
    }
    Ok(())
}

/// Task commands need ownership, except from the administrative group.
pub fn check_task_owner(
    task_id: &str,
    owner: &str,
    source: &str,
    admin: &str,
) -> Result<(), Rejection> {
    if source == admin || owner == source {
        Ok(())
    } else {
        Err(Rejection::NotTaskOwner {
            task_id: task_id.to_string(),
            owner: owner.to_string(),
            source_group: source.to_string(),
        })
    }
}

/// Non-administrative groups may only address their own conversation.
pub fn check_target(
    source: &str,
    source_jid: &str,
    target_jid: &str,
    admin: &str,
) -> Result<(), Rejection> {
    if source == admin || source_jid == target_jid {
        Ok(())
    } else {
        Err(Rejection::ForeignTarget {
            source_group: source.to_string(),
            chat_jid: target_jid.to_string(),
        })
    }
}
