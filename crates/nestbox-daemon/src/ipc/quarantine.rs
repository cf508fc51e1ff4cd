//! Quarantine of rejected Command Bus documents.

use std::path::{Path, PathBuf};

use chrono::Utc;
use nestbox_core::ipc::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::authz::Rejection;
use super::layout::IpcLayout;

/// Sidecar written next to every quarantined file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineRecord {
    pub reason: String,
    pub category: String,
    /// `None` when the document was too broken to name one.
    pub source_group: Option<String>,
    pub directory: String,
    pub original_name: String,
    pub timestamp: String,
}

/// Move `path` into the quarantine directory and record why.
///
/// Quarantined files are never picked up again.
pub fn quarantine(
    layout: &IpcLayout,
    directory: &str,
    path: &Path,
    claimed_source: Option<&str>,
    rejection: &Rejection,
) -> std::io::Result<PathBuf> {
    let errors = layout.errors_dir();
    std::fs::create_dir_all(&errors)?;

    let original_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = errors.join(format!("{directory}-{original_name}"));
    std::fs::rename(path, &target)?;

    let record = QuarantineRecord {
        reason: rejection.to_string(),
        category: rejection.category().to_string(),
        source_group: claimed_source.map(str::to_string),
        directory: directory.to_string(),
        original_name,
        timestamp: Utc::now().to_rfc3339(),
    };
    let meta_name = format!(
        "{}.meta.json",
        target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    let bytes = serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?;
    if let Err(e) = write_atomic(&errors, &meta_name, &bytes) {
        warn!(file = %target.display(), error = %e, "Failed to write quarantine record");
    }

    warn!(
        group = directory,
        file = %target.display(),
        reason = %rejection,
        "Command quarantined"
    );
    Ok(target)
}
