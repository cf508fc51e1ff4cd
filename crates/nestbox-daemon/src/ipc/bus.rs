//! Host side of the Command Bus.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use nestbox_core::db::unix_timestamp_ms;
use nestbox_core::ipc::{self, CommandPayload, IpcCommand, OutboundMessage};
use nestbox_core::schedule::{self, ContextMode, ScheduleType};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::authz::{self, Rejection};
use super::layout::{ERRORS_DIR, IpcLayout};
use super::quarantine::quarantine;
use super::snapshots;
use super::IpcError;
use crate::channel::ChannelRouter;
use crate::groups::GroupRegistry;
use crate::storage::{Database, DatabaseError, NewTask, RegisteredGroup, TaskStatus};

/// Result of one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub applied: usize,
    pub quarantined: usize,
    /// Consumed without effect, e.g. a task that no longer exists.
    pub dropped: usize,
}

impl ScanReport {
    fn merge(&mut self, other: Self) {
        self.applied += other.applied;
        self.quarantined += other.quarantined;
        self.dropped += other.dropped;
    }

    pub const fn total(&self) -> usize {
        self.applied + self.quarantined + self.dropped
    }
}

enum Applied {
    Done,
    Dropped(String),
}

enum CommandError {
    Rejected(Rejection),
    Store(DatabaseError),
    Io(std::io::Error),
}

impl From<Rejection> for CommandError {
    fn from(r: Rejection) -> Self {
        Self::Rejected(r)
    }
}

impl From<DatabaseError> for CommandError {
    fn from(e: DatabaseError) -> Self {
        Self::Store(e)
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<IpcError> for CommandError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Io(e) => Self::Io(e),
            IpcError::Store(e) => Self::Store(e),
            IpcError::Protocol(e) => Self::Io(std::io::Error::other(e)),
        }
    }
}

/// Settings the bus needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub admin_folder: String,
    pub assistant_name: String,
    /// Parent of per-group working folders, created on registration.
    pub groups_dir: PathBuf,
}

/// Scans group namespaces and applies authorized commands.
pub struct CommandBus {
    layout: IpcLayout,
    db: Database,
    registry: Arc<GroupRegistry>,
    router: ChannelRouter,
    settings: BusSettings,
    scan_lock: Mutex<()>,
}

impl CommandBus {
    pub fn new(
        layout: IpcLayout,
        db: Database,
        registry: Arc<GroupRegistry>,
        router: ChannelRouter,
        settings: BusSettings,
    ) -> Self {
        Self {
            layout,
            db,
            registry,
            router,
            settings,
            scan_lock: Mutex::new(()),
        }
    }

    pub const fn layout(&self) -> &IpcLayout {
        &self.layout
    }

    /// Process every group namespace once.
    ///
    /// Only store failures are returned; everything else is handled per file.
    pub async fn scan(&self) -> Result<ScanReport, IpcError> {
        let _guard = self.scan_lock.lock().await;
        let mut report = ScanReport::default();
        for folder in self.layout.group_folders()? {
            report.merge(self.scan_folder(&folder).await?);
        }
        if report.total() > 0 {
            debug!(
                applied = report.applied,
                quarantined = report.quarantined,
                dropped = report.dropped,
                "Command Bus scan"
            );
        }
        Ok(report)
    }

    /// Process one group namespace, e.g. right after its execution ended.
    pub async fn scan_group(&self, folder: &str) -> Result<ScanReport, IpcError> {
        let _guard = self.scan_lock.lock().await;
        self.scan_folder(folder).await
    }

    async fn scan_folder(&self, folder: &str) -> Result<ScanReport, IpcError> {
        let mut report = ScanReport::default();
        for path in list_documents(&self.layout.messages_dir(folder))? {
            self.handle_file(folder, &path, &mut report, FileKind::Message)
                .await?;
        }
        for path in list_documents(&self.layout.tasks_dir(folder))? {
            self.handle_file(folder, &path, &mut report, FileKind::Command)
                .await?;
        }
        Ok(report)
    }

    async fn handle_file(
        &self,
        folder: &str,
        path: &Path,
        report: &mut ScanReport,
        kind: FileKind,
    ) -> Result<(), IpcError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = match kind {
            FileKind::Command => match IpcCommand::parse(&bytes) {
                Ok(command) => self.apply_command(folder, &command).await,
                Err(e) => Err(Rejection::Malformed(e.to_string()).into()),
            },
            FileKind::Message => match OutboundMessage::parse(&bytes) {
                Ok(message) => self.apply_message(folder, &message).await,
                Err(e) => Err(Rejection::Malformed(e.to_string()).into()),
            },
        };

        match result {
            Ok(Applied::Done) => {
                consume(path);
                report.applied += 1;
            }
            Ok(Applied::Dropped(reason)) => {
                warn!(group = folder, file = %path.display(), reason = %reason, "Command dropped");
                consume(path);
                report.dropped += 1;
            }
            Err(CommandError::Rejected(rejection)) => {
                let claimed = claimed_source(&bytes);
                if let Err(e) = quarantine(&self.layout, folder, path, claimed.as_deref(), &rejection) {
                    warn!(file = %path.display(), error = %e, "Quarantine failed, deleting");
                    consume(path);
                }
                report.quarantined += 1;
            }
            Err(CommandError::Io(e)) => {
                warn!(group = folder, file = %path.display(), error = %e, "Command failed");
                consume(path);
                report.dropped += 1;
            }
            Err(CommandError::Store(e)) => {
                consume(path);
                return Err(IpcError::Store(e));
            }
        }
        Ok(())
    }

    async fn apply_command(
        &self,
        folder: &str,
        command: &IpcCommand,
    ) -> Result<Applied, CommandError> {
        let admin = self.settings.admin_folder.as_str();
        authz::check_source(folder, &command.source_group)?;
        authz::check_admin(&command.payload, &command.source_group, admin)?;

        match &command.payload {
            CommandPayload::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                chat_jid,
            } => {
                self.schedule_task(
                    folder,
                    prompt,
                    *schedule_type,
                    schedule_value,
                    *context_mode,
                    chat_jid.as_deref(),
                )
                .await
            }
            CommandPayload::PauseTask { task_id } => {
                self.set_task_status(folder, task_id, TaskStatus::Paused)
                    .await
            }
            CommandPayload::ResumeTask { task_id } => {
                self.set_task_status(folder, task_id, TaskStatus::Active)
                    .await
            }
            CommandPayload::CancelTask { task_id } => self.cancel_task(folder, task_id).await,
            CommandPayload::RegisterGroup {
                name,
                folder: new_folder,
                trigger,
                chat_jid,
                requires_trigger,
            } => {
                self.register_group(name, new_folder, trigger.as_deref(), chat_jid, *requires_trigger)
                    .await
            }
            CommandPayload::RefreshGroups => {
                self.registry.reload().await?;
                self.write_groups_snapshot().await?;
                info!("Groups refreshed on request");
                Ok(Applied::Done)
            }
        }
    }

    async fn apply_message(
        &self,
        folder: &str,
        message: &OutboundMessage,
    ) -> Result<Applied, CommandError> {
        let admin = self.settings.admin_folder.as_str();
        authz::check_source(folder, &message.source_group)?;
        if folder != admin {
            let own = self
                .registry
                .get(folder)
                .await
                .ok_or_else(|| Rejection::UnknownGroup(folder.to_string()))?;
            authz::check_target(folder, &own.jid, &message.chat_jid, admin)?;
        }

        match self.router.send(&message.chat_jid, &message.text).await {
            Ok(()) => {
                info!(group = folder, chat = %message.chat_jid, "Agent message sent");
                Ok(Applied::Done)
            }
            Err(e) => Ok(Applied::Dropped(format!("delivery failed: {e}"))),
        }
    }

    async fn schedule_task(
        &self,
        folder: &str,
        prompt: &str,
        schedule_type: ScheduleType,
        schedule_value: &str,
        context_mode: ContextMode,
        chat_jid: Option<&str>,
    ) -> Result<Applied, CommandError> {
        let admin = self.settings.admin_folder.as_str();
        let source = self.registry.get(folder).await;
        let target_jid = match (chat_jid, &source) {
            (Some(jid), _) => jid.to_string(),
            (None, Some(group)) => group.jid.clone(),
            (None, None) => return Err(Rejection::UnknownGroup(folder.to_string()).into()),
        };
        let source_jid = source.map(|g| g.jid).unwrap_or_default();
        authz::check_target(folder, &source_jid, &target_jid, admin)?;

        let target = self
            .registry
            .by_jid(&target_jid)
            .await
            .ok_or_else(|| Rejection::UnknownTarget(target_jid.clone()))?;

        let next_run = schedule::first_run(schedule_type, schedule_value, Utc::now())
            .map_err(|e| Rejection::Malformed(e.to_string()))?;

        let task = self
            .db
            .create_task(&NewTask {
                id: format!("task-{}", uuid::Uuid::new_v4().simple()),
                group_folder: target.folder,
                chat_jid: target_jid,
                prompt: prompt.to_string(),
                schedule_type,
                schedule_value: schedule_value.to_string(),
                context_mode,
                next_run,
            })
            .await?;

        info!(
            group = %task.group_folder,
            task_id = %task.id,
            schedule_type = %schedule_type,
            next_run,
            "Task scheduled"
        );
        Ok(Applied::Done)
    }

    async fn set_task_status(
        &self,
        folder: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Applied, CommandError> {
        let task = match self.db.get_task(task_id).await {
            Ok(task) => task,
            Err(DatabaseError::NotFound(_)) => {
                return Ok(Applied::Dropped(format!("task {task_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        authz::check_task_owner(task_id, &task.group_folder, folder, &self.settings.admin_folder)?;

        self.db.update_task_status(task_id, status).await?;
        info!(group = folder, task_id, status = %status, "Task status changed");
        Ok(Applied::Done)
    }

    async fn cancel_task(&self, folder: &str, task_id: &str) -> Result<Applied, CommandError> {
        let task = match self.db.get_task(task_id).await {
            Ok(task) => task,
            Err(DatabaseError::NotFound(_)) => {
                return Ok(Applied::Dropped(format!("task {task_id} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        authz::check_task_owner(task_id, &task.group_folder, folder, &self.settings.admin_folder)?;

        match self.db.delete_task(task_id).await {
            Ok(()) | Err(DatabaseError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(group = folder, task_id, "Task cancelled");
        Ok(Applied::Done)
    }

    async fn register_group(
        &self,
        name: &str,
        folder: &str,
        trigger: Option<&str>,
        chat_jid: &str,
        requires_trigger: Option<bool>,
    ) -> Result<Applied, CommandError> {
        if folder == ERRORS_DIR {
            return Err(Rejection::ReservedFolder(folder.to_string()).into());
        }
        if let Some(other) = self.registry.by_jid(chat_jid).await
            && other.folder != folder
        {
            return Err(Rejection::Malformed(format!(
                "{chat_jid} is already registered as '{}'",
                other.folder
            ))
            .into());
        }

        let existing = self.registry.get(folder).await;
        let group = RegisteredGroup {
            folder: folder.to_string(),
            jid: chat_jid.to_string(),
            name: name.to_string(),
            trigger_pattern: trigger
                .map(str::to_string)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("@{}", self.settings.assistant_name)),
            requires_trigger: requires_trigger.unwrap_or(true),
            container_config: existing.map(|g| g.container_config).unwrap_or_default(),
            added_at: unix_timestamp_ms(),
        };

        std::fs::create_dir_all(self.settings.groups_dir.join(folder))?;
        self.layout.ensure_group(folder)?;
        self.registry.register(group).await?;
        self.write_groups_snapshot().await?;
        Ok(Applied::Done)
    }

    /// Write the snapshots an execution for `folder` will read.
    pub async fn write_snapshots(&self, folder: &str) -> Result<(), IpcError> {
        let is_main = folder == self.settings.admin_folder;
        let tasks = if is_main {
            self.db.list_tasks(None).await?
        } else {
            self.db.list_tasks(Some(folder)).await?
        };
        snapshots::write_tasks_snapshot(&self.layout, folder, is_main, &tasks)?;
        if is_main {
            self.write_groups_snapshot().await?;
        }
        Ok(())
    }

    async fn write_groups_snapshot(&self) -> Result<(), IpcError> {
        let chats = self.db.list_chats().await?;
        let registered: HashSet<String> = self
            .registry
            .all()
            .await
            .into_iter()
            .map(|g| g.jid)
            .collect();
        snapshots::write_groups_snapshot(
            &self.layout,
            &self.settings.admin_folder,
            &chats,
            &registered,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum FileKind {
    Command,
    Message,
}

/// Complete documents in `dir`, in filename order.
fn list_documents(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && ipc::is_document(p))
        .collect();
    files.sort();
    Ok(files)
}

fn consume(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(file = %path.display(), error = %e, "Failed to delete command file");
    }
}

/// Best-effort `sourceGroup` of a document that failed to parse.
fn claimed_source(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()?
        .get("sourceGroup")?
        .as_str()
        .map(str::to_string)
}
