//! Command Bus wire format.
//!
//! Agents request host actions by dropping JSON documents into their group's
//! IPC namespace. Every document names the group it claims to come from in
//! `sourceGroup`; the host checks that claim against the directory the file
//! was found in.
//!
//! Files are written to a `.tmp` sibling and renamed into place, so readers
//! that only pick up `*.json` never observe a partial document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::unix_timestamp_ms;
use crate::error::{Error, Result};
use crate::schedule::{self, ContextMode, ScheduleType};

/// Extension of every complete IPC document.
pub const FILE_EXTENSION: &str = "json";

/// Extension used while a document is still being written.
pub const TEMP_EXTENSION: &str = "tmp";

/// A host-bound command found in a group's `tasks/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcCommand {
    #[serde(rename = "sourceGroup")]
    pub source_group: String,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

/// The action requested by an [`IpcCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    ScheduleTask {
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_jid: Option<String>,
    },
    PauseTask {
        task_id: String,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    RegisterGroup {
        name: String,
        folder: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
        chat_jid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requires_trigger: Option<bool>,
    },
    RefreshGroups,
}

impl CommandPayload {
    /// Wire name of the command kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ScheduleTask { .. } => "schedule_task",
            Self::PauseTask { .. } => "pause_task",
            Self::ResumeTask { .. } => "resume_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::RegisterGroup { .. } => "register_group",
            Self::RefreshGroups => "refresh_groups",
        }
    }

    /// Commands only the administrative group may issue.
    pub const fn requires_admin(&self) -> bool {
        matches!(self, Self::RegisterGroup { .. } | Self::RefreshGroups)
    }

    /// Task referenced by pause/resume/cancel.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::PauseTask { task_id }
            | Self::ResumeTask { task_id }
            | Self::CancelTask { task_id } => Some(task_id),
            _ => None,
        }
    }
}

impl IpcCommand {
    /// Parse and structurally validate a command document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let command: Self = serde_json::from_slice(bytes)?;
        command.validate()?;
        Ok(command)
    }

    /// Field-level checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.source_group.trim().is_empty() {
            return Err(Error::Command("sourceGroup must not be empty".into()));
        }
        match &self.payload {
            CommandPayload::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                ..
            } => {
                if prompt.trim().is_empty() {
                    return Err(Error::Command("schedule_task: prompt is empty".into()));
                }
                schedule::validate(*schedule_type, schedule_value)?;
            }
            CommandPayload::PauseTask { task_id }
            | CommandPayload::ResumeTask { task_id }
            | CommandPayload::CancelTask { task_id } => {
                if task_id.trim().is_empty() {
                    return Err(Error::Command(format!(
                        "{}: task_id is empty",
                        self.payload.kind()
                    )));
                }
            }
            CommandPayload::RegisterGroup {
                name,
                folder,
                chat_jid,
                ..
            } => {
                if name.trim().is_empty() || chat_jid.trim().is_empty() {
                    return Err(Error::Command(
                        "register_group: name and chat_jid are required".into(),
                    ));
                }
                if !is_valid_group_folder(folder) {
                    return Err(Error::Command(format!(
                        "register_group: invalid folder '{folder}'"
                    )));
                }
            }
            CommandPayload::RefreshGroups => {}
        }
        Ok(())
    }
}

/// Kind tag of an [`OutboundMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Message,
}

/// A chat message an agent asks the host to send, found in `messages/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub chat_jid: String,
    pub text: String,
    #[serde(rename = "sourceGroup")]
    pub source_group: String,
}

impl OutboundMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(bytes)?;
        if message.source_group.trim().is_empty() {
            return Err(Error::Command("sourceGroup must not be empty".into()));
        }
        if message.chat_jid.trim().is_empty() {
            return Err(Error::Command("message: chat_jid is empty".into()));
        }
        Ok(message)
    }
}

/// Folder names usable as a group key and a directory name.
///
/// Lowercase ASCII letters, digits, `-` and `_`, starting with a letter or
/// digit, at most 64 characters.
pub fn is_valid_group_folder(folder: &str) -> bool {
    let bytes = folder.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 64
        && bytes[0].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'_')
}

/// `{epoch-ms}-{random}.json`; lexical order approximates arrival order.
pub fn document_filename() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013}-{}.{FILE_EXTENSION}", unix_timestamp_ms(), &suffix[..8])
}

/// Whether `path` names a complete IPC document.
pub fn is_document(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION)
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| !s.is_empty() && !s.starts_with('.'))
}

/// Write `bytes` to `dir/filename` via a temporary sibling and a rename.
pub fn write_atomic(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(filename);
    let temp = dir.join(format!("{filename}.{TEMP_EXTENSION}"));
    std::fs::write(&temp, bytes)?;
    if let Err(e) = std::fs::rename(&temp, &target) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(target)
}

/// Serialize `value` and publish it atomically under a fresh document name.
pub fn write_document<T: Serialize>(dir: &Path, value: &T) -> Result<PathBuf> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(dir, &document_filename(), &bytes)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let commands = vec![
            IpcCommand {
                source_group: "main".into(),
                payload: CommandPayload::ScheduleTask {
                    prompt: "Summarise the week".into(),
                    schedule_type: ScheduleType::Cron,
                    schedule_value: "0 9 * * 1".into(),
                    context_mode: ContextMode::Group,
                    chat_jid: Some("123@g.us".into()),
                },
            },
            IpcCommand {
                source_group: "ops".into(),
                payload: CommandPayload::CancelTask {
                    task_id: "task-1".into(),
                },
            },
            IpcCommand {
                source_group: "main".into(),
                payload: CommandPayload::RegisterGroup {
                    name: "Ops".into(),
                    folder: "ops".into(),
                    trigger: None,
                    chat_jid: "x@g.us".into(),
                    requires_trigger: Some(false),
                },
            },
            IpcCommand {
                source_group: "main".into(),
                payload: CommandPayload::RefreshGroups,
            },
        ];

        for command in commands {
            let path = write_document(dir.path(), &command).unwrap();
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(IpcCommand::parse(&bytes).unwrap(), command);
        }
    }

    #[test]
    fn wire_shape_is_flat() {
        let json = r#"{"type":"pause_task","task_id":"t1","sourceGroup":"family"}"#;
        let command = IpcCommand::parse(json.as_bytes()).unwrap();
        assert_eq!(command.source_group, "family");
        assert_eq!(command.payload.kind(), "pause_task");
        assert_eq!(command.payload.task_id(), Some("t1"));

        let refresh = r#"{"type":"refresh_groups","sourceGroup":"main"}"#;
        let command = IpcCommand::parse(refresh.as_bytes()).unwrap();
        assert_eq!(command.payload, CommandPayload::RefreshGroups);
        assert!(command.payload.requires_admin());
    }

    #[test]
    fn schedule_task_defaults_to_isolated_context() {
        let json = r#"{"type":"schedule_task","prompt":"p","schedule_type":"interval","schedule_value":"60000","sourceGroup":"g"}"#;
        let command = IpcCommand::parse(json.as_bytes()).unwrap();
        match command.payload {
            CommandPayload::ScheduleTask {
                context_mode,
                chat_jid,
                ..
            } => {
                assert_eq!(context_mode, ContextMode::Isolated);
                assert!(chat_jid.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let cases = [
            r#"{"type":"cancel_task","sourceGroup":"g"}"#,
            r#"{"type":"cancel_task","task_id":"t"}"#,
            r#"{"type":"launch_missiles","sourceGroup":"g"}"#,
            r#"{"type":"schedule_task","prompt":"p","schedule_type":"cron","schedule_value":"nope","sourceGroup":"g"}"#,
            r#"{"type":"register_group","name":"X","folder":"../etc","chat_jid":"j","sourceGroup":"main"}"#,
            r#"{"type":"cancel_task","task_id":"t","sourceGroup":"  "}"#,
            "not json",
        ];
        for case in cases {
            assert!(IpcCommand::parse(case.as_bytes()).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn group_folder_rules() {
        assert!(is_valid_group_folder("main"));
        assert!(is_valid_group_folder("family-chat_2"));
        assert!(!is_valid_group_folder(""));
        assert!(!is_valid_group_folder("-lead"));
        assert!(!is_valid_group_folder("Upper"));
        assert!(!is_valid_group_folder("a/b"));
        assert!(!is_valid_group_folder(&"a".repeat(65)));
    }

    #[test]
    fn filenames_sort_by_time_and_are_documents() {
        let first = document_filename();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = document_filename();
        assert!(first < second);
        assert!(is_document(Path::new(&first)));
        assert!(!is_document(Path::new(&format!("{first}.tmp"))));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        write_atomic(dir.path(), "a.json", b"{}").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.json"]);
    }

    #[test]
    fn outbound_message_parses() {
        let json = r#"{"type":"message","chat_jid":"1@g.us","text":"hi","sourceGroup":"main"}"#;
        let message = OutboundMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(message.kind, OutboundKind::Message);
        assert_eq!(message.text, "hi");
    }
}
