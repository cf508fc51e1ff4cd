//! On-disk layout of the per-group IPC namespaces.
//!
//! ```text
//! <ipc root>/
//!   <group>/
//!     tasks/               host-bound commands
//!     messages/            outbound chat messages
//!     input/               continuation turns and the close marker
//!     current_tasks.json   snapshot written before each launch
//!     available_groups.json (administrative group only)
//!   errors/                quarantine
//! ```

use std::path::{Path, PathBuf};

use nestbox_core::ipc;
use nestbox_core::protocol::{CLOSE_MARKER, ContinuationMessage};

/// Name of the quarantine directory; never usable as a group folder.
pub const ERRORS_DIR: &str = "errors";
pub const TASKS_DIR: &str = "tasks";
pub const MESSAGES_DIR: &str = "messages";
pub const INPUT_DIR: &str = "input";
pub const TASKS_SNAPSHOT: &str = "current_tasks.json";
pub const GROUPS_SNAPSHOT: &str = "available_groups.json";

/// Paths of the IPC tree rooted at one directory.
#[derive(Debug, Clone)]
pub struct IpcLayout {
    root: PathBuf,
}

impl IpcLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.root.join(folder)
    }

    pub fn tasks_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join(TASKS_DIR)
    }

    pub fn messages_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join(MESSAGES_DIR)
    }

    pub fn input_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join(INPUT_DIR)
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.root.join(ERRORS_DIR)
    }

    /// Create a group's namespace if missing.
    pub fn ensure_group(&self, folder: &str) -> std::io::Result<PathBuf> {
        for dir in [
            self.tasks_dir(folder),
            self.messages_dir(folder),
            self.input_dir(folder),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(self.group_dir(folder))
    }

    /// Group namespaces present on disk, sorted.
    pub fn group_folders(&self) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut folders: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name != ERRORS_DIR)
            .collect();
        folders.sort();
        Ok(folders)
    }

    /// Remove leftovers of a previous handle, including a stale close marker.
    pub fn clear_input(&self, folder: &str) -> std::io::Result<usize> {
        let dir = self.input_dir(folder);
        std::fs::create_dir_all(&dir)?;
        let mut removed = 0;
        for entry in std::fs::read_dir(&dir)?.filter_map(Result::ok) {
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Queue one follow-up message for a live handle.
    pub fn write_continuation(
        &self,
        folder: &str,
        message: &ContinuationMessage,
    ) -> nestbox_core::Result<PathBuf> {
        ipc::write_document(&self.input_dir(folder), message)
    }

    /// Ask the agent to end its run.
    pub fn write_close_marker(&self, folder: &str) -> nestbox_core::Result<PathBuf> {
        ipc::write_atomic(&self.input_dir(folder), CLOSE_MARKER, &[])
    }

    /// Timestamp of the oldest continuation the agent left unread.
    ///
    /// Agents delete each continuation file once they have taken it in, so
    /// whatever is still here after a run was never answered. Unreadable
    /// files are skipped.
    pub fn oldest_unread_continuation(&self, folder: &str) -> std::io::Result<Option<i64>> {
        let dir = self.input_dir(folder);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut oldest: Option<i64> = None;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !ipc::is_document(&path) {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if let Ok(message) = serde_json::from_slice::<ContinuationMessage>(&bytes) {
                oldest = Some(oldest.map_or(message.timestamp, |t| t.min(message.timestamp)));
            }
        }
        Ok(oldest)
    }

    pub fn has_close_marker(&self, folder: &str) -> bool {
        self.input_dir(folder).join(CLOSE_MARKER).exists()
    }
}
