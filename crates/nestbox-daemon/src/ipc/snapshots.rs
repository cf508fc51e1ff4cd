//! Read-only state snapshots handed to agents.
//!
//! Agents cannot query the store, so the host writes what they may need into
//! their namespace just before each launch.

use std::collections::HashSet;
use std::path::PathBuf;

use nestbox_core::db::unix_timestamp_ms;
use nestbox_core::ipc::write_atomic;
use serde::{Deserialize, Serialize};

use super::layout::{GROUPS_SNAPSHOT, IpcLayout, TASKS_SNAPSHOT};
use crate::storage::{Chat, ScheduledTask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: Option<i64>,
}

impl From<&ScheduledTask> for TaskSnapshot {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            id: task.id.clone(),
            group_folder: task.group_folder.clone(),
            prompt: task.prompt.clone(),
            schedule_type: task.schedule_type.clone(),
            schedule_value: task.schedule_value.clone(),
            status: task.status.clone(),
            next_run: task.next_run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub jid: String,
    pub name: String,
    pub last_activity: i64,
    pub is_registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableGroups {
    pub groups: Vec<GroupSnapshot>,
    pub last_sync: i64,
}

/// Write `current_tasks.json`. The administrative group sees every task.
pub fn write_tasks_snapshot(
    layout: &IpcLayout,
    folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
) -> nestbox_core::Result<PathBuf> {
    let visible: Vec<TaskSnapshot> = tasks
        .iter()
        .filter(|t| is_main || t.group_folder == folder)
        .map(TaskSnapshot::from)
        .collect();
    let bytes = serde_json::to_vec_pretty(&visible)?;
    write_atomic(&layout.group_dir(folder), TASKS_SNAPSHOT, &bytes)
}

/// Write `available_groups.json` into the administrative namespace.
pub fn write_groups_snapshot(
    layout: &IpcLayout,
    admin_folder: &str,
    chats: &[Chat],
    registered_jids: &HashSet<String>,
) -> nestbox_core::Result<PathBuf> {
    let snapshot = AvailableGroups {
        groups: chats
            .iter()
            .map(|c| GroupSnapshot {
                jid: c.jid.clone(),
                name: c.name.clone().unwrap_or_else(|| c.jid.clone()),
                last_activity: c.last_message_time,
                is_registered: registered_jids.contains(&c.jid),
            })
            .collect(),
        last_sync: unix_timestamp_ms(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    write_atomic(&layout.group_dir(admin_folder), GROUPS_SNAPSHOT, &bytes)
}
