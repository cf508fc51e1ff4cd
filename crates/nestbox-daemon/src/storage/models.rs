//! Database models for the `Nestbox` daemon.

use serde::{Deserialize, Serialize};

/// Conversation metadata from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Chat {
    pub jid: String,
    pub name: Option<String>,
    pub channel: Option<String>,
    pub is_group: i64,
    pub last_message_time: i64,
}

/// Message record from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
    pub is_from_me: i64,
    pub is_bot_message: i64,
}

/// Message about to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

/// Registered group row from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupRow {
    pub folder: String,
    pub jid: String,
    pub name: String,
    pub trigger_pattern: String,
    pub requires_trigger: i64,
    pub container_config: Option<String>,
    pub added_at: i64,
}

impl GroupRow {
    pub fn into_group(self) -> RegisteredGroup {
        let container_config = self
            .container_config
            .as_deref()
            .and_then(|raw| match serde_json::from_str(raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(group = %self.folder, error = %e, "Ignoring unreadable container config");
                    None
                }
            })
            .unwrap_or_default();
        RegisteredGroup {
            folder: self.folder,
            jid: self.jid,
            name: self.name,
            trigger_pattern: self.trigger_pattern,
            requires_trigger: self.requires_trigger != 0,
            container_config,
            added_at: self.added_at,
        }
    }
}

/// A conversation the daemon runs agents for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Unique key, also the name of the group's working and IPC directories.
    pub folder: String,
    pub jid: String,
    pub name: String,
    pub trigger_pattern: String,
    pub requires_trigger: bool,
    pub container_config: ContainerConfig,
    pub added_at: i64,
}

/// Per-group sandbox overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Replaces the global hard deadline for this group.
    pub timeout_secs: Option<u64>,
    pub additional_mounts: Vec<AdditionalMount>,
}

impl ContainerConfig {
    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }
}

/// Extra host directory exposed under `/workspace/extra/<container_path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalMount {
    pub host_path: std::path::PathBuf,
    pub container_path: String,
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

const fn default_readonly() -> bool {
    true
}

/// Scheduled task record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub context_mode: String,
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
    pub last_result: Option<String>,
    pub status: String,
    pub created_at: i64,
}

/// Task about to be stored.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: nestbox_core::schedule::ScheduleType,
    pub schedule_value: String,
    pub context_mode: nestbox_core::schedule::ContextMode,
    pub next_run: i64,
}

/// One execution of a scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRunLog {
    pub id: i64,
    pub task_id: String,
    pub run_at: i64,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Scheduled task status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
