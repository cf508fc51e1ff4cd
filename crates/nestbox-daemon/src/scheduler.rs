//! Scheduled task runner.
//!
//! Due tasks run on the Execution Queue under their group's folder, so they
//! serialize with that group's message turns and count against the global
//! limit. A task that is already queued or running is not submitted again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use nestbox_core::db::unix_timestamp_ms;
use nestbox_core::protocol::{ExecutionInput, PROTOCOL_VERSION, Secrets};
use nestbox_core::schedule::{self, ContextMode, ScheduleType};
use tracing::{debug, info, warn};

use crate::ipc::IpcError;
use crate::orchestrator::{
    ActiveHandle, ClosePolicy, Delivery, OrchestratorContext, OrchestratorError, classify,
    format_messages, forward_blocks,
};
use crate::runner::{ExecutionFailure, RunRequest};
use crate::storage::{DatabaseError, ScheduledTask, TaskStatus};

/// Recent messages prepended to `group`-context tasks.
const CONTEXT_MESSAGES: u32 = 20;

/// Quiet period after a task's output before its run is closed.
const TASK_CLOSE_DELAY: Duration = Duration::from_secs(10);

/// Stored result summaries are cut to this many characters.
const RESULT_SUMMARY_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] nestbox_core::Error),
}

/// Submits due tasks on every tick.
pub struct Scheduler {
    ctx: Arc<OrchestratorContext>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Tasks queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue every due task that is not already in flight.
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let due = self.ctx.db.due_tasks(unix_timestamp_ms()).await?;
        let mut submitted = 0;

        for task in due {
            if !self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task.id.clone())
            {
                continue;
            }

            let ctx = Arc::clone(&self.ctx);
            let in_flight = Arc::clone(&self.in_flight);
            let task_id = task.id.clone();
            let work = async move {
                if let Err(e) = run_task(&ctx, &task_id).await {
                    match e {
                        SchedulerError::Store(e) => ctx.report_fatal(OrchestratorError::from(e)),
                        other => warn!(task_id = %task_id, error = %other, "Task run failed"),
                    }
                }
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
            };

            match self.ctx.queue.submit(&task.group_folder, work) {
                Ok(_) => {
                    debug!(task_id = %task.id, group = %task.group_folder, "Task queued");
                    submitted += 1;
                }
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Task not queued");
                    self.in_flight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&task.id);
                }
            }
        }

        if submitted > 0 {
            info!(count = submitted, "Scheduled tasks queued");
        }
        Ok(submitted)
    }
}

/// Run one task, record it, and move it to its next slot.
async fn run_task(ctx: &OrchestratorContext, task_id: &str) -> Result<(), SchedulerError> {
    let task = match ctx.db.get_task(task_id).await {
        Ok(task) => task,
        Err(DatabaseError::NotFound(_)) => {
            debug!(task_id, "Task deleted before it ran");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if TaskStatus::parse(&task.status) != Some(TaskStatus::Active) {
        debug!(task_id, status = %task.status, "Task no longer active, skipping");
        return Ok(());
    }

    let run_at = unix_timestamp_ms();
    let started = Instant::now();
    info!(task_id, group = %task.group_folder, "Running scheduled task");

    let (failure, delivery) = match execute_task(ctx, &task).await {
        Ok(result) => result,
        Err(SchedulerError::Store(e)) => return Err(e.into()),
        Err(e) => {
            warn!(task_id, error = %e, "Task could not start");
            (Some(Err(e.to_string())), Delivery::default())
        }
    };
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    let error = match &failure {
        None => None,
        Some(Ok(failure)) => Some(failure.to_string()),
        Some(Err(reason)) => Some(reason.clone()),
    };
    let summary = error.as_ref().map_or_else(
        || {
            delivery
                .last_text
                .as_deref()
                .map_or_else(|| "Completed".to_string(), summarize)
        },
        |e| format!("Error: {e}"),
    );

    // Cancelled while running: nothing left to record against.
    if matches!(ctx.db.get_task(task_id).await, Err(DatabaseError::NotFound(_))) {
        debug!(task_id, "Task deleted while running");
        return Ok(());
    }

    ctx.db
        .log_task_run(
            task_id,
            run_at,
            duration_ms,
            if error.is_some() { "error" } else { "success" },
            delivery.last_text.as_deref(),
            error.as_deref(),
        )
        .await?;

    let next = next_slot(&task, error.is_some());
    ctx.db
        .record_task_run(task_id, run_at, next, &summary)
        .await?;

    match &error {
        None => info!(task_id, duration_ms, next_run = ?next, "Scheduled task complete"),
        Some(e) => warn!(task_id, duration_ms, error = %e, next_run = ?next, "Scheduled task failed"),
    }
    Ok(())
}

/// Outcome of a launched task: `Ok` for a classified failure, `Err` for a
/// setup problem.
type TaskFailure = Option<Result<ExecutionFailure, String>>;

async fn execute_task(
    ctx: &OrchestratorContext,
    task: &ScheduledTask,
) -> Result<(TaskFailure, Delivery), SchedulerError> {
    let folder = task.group_folder.as_str();
    let Some(group) = ctx.registry.get(folder).await else {
        return Ok((
            Some(Err(format!("group '{folder}' is not registered"))),
            Delivery::default(),
        ));
    };
    let context_mode: ContextMode = task.context_mode.parse()?;

    let prompt = match context_mode {
        ContextMode::Group => {
            let recent = ctx
                .db
                .recent_messages(&task.chat_jid, CONTEXT_MESSAGES)
                .await?;
            if recent.is_empty() {
                task.prompt.clone()
            } else {
                format!("{}\n\n{}", format_messages(&recent), task.prompt)
            }
        }
        ContextMode::Isolated => task.prompt.clone(),
    };

    if let Err(e) = ctx.layout.ensure_group(folder) {
        return Ok((Some(Err(e.to_string())), Delivery::default()));
    }
    if let Err(e) = ctx.layout.clear_input(folder) {
        warn!(group = folder, error = %e, "Failed to clear continuation directory");
    }
    match ctx.bus.write_snapshots(folder).await {
        Ok(()) => {}
        Err(IpcError::Store(e)) => return Err(e.into()),
        Err(e) => warn!(group = folder, error = %e, "Failed to write snapshots"),
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    ctx.handles.insert(
        folder,
        ActiveHandle {
            session_id: session_id.clone(),
            chat_jid: task.chat_jid.clone(),
            accepts_continuation: false,
            control: None,
        },
    );

    let request = RunRequest {
        input: ExecutionInput {
            version: PROTOCOL_VERSION,
            prompt,
            session_id,
            group_folder: folder.to_string(),
            chat_jid: task.chat_jid.clone(),
            is_main: ctx.registry.is_main(folder),
            is_scheduled_task: true,
            assistant_name: ctx.config.assistant.name.clone(),
            secrets: Secrets::new(),
        },
        group_dir: ctx.config.paths.groups_dir().join(folder),
        ipc_dir: ctx.layout.group_dir(folder),
        container_config: group.container_config,
    };

    let mut running = match ctx.runner.launch(request).await {
        Ok(running) => running,
        Err(e) => {
            ctx.handles.remove(folder);
            return Ok((Some(Err(e.to_string())), Delivery::default()));
        }
    };
    ctx.handles.attach_control(folder, running.control.clone());

    let delivery = forward_blocks(
        &ctx.router,
        &ctx.layout,
        &ctx.handles,
        folder,
        &task.chat_jid,
        &mut running.blocks,
        ClosePolicy {
            after_output: TASK_CLOSE_DELAY,
        },
    )
    .await;
    let outcome = running.outcome().await;
    ctx.handles.remove(folder);

    if let Err(e) = ctx.scan_commands(folder).await {
        ctx.report_fatal(e);
    }

    Ok((classify(&outcome, &delivery).map(Ok), delivery))
}

/// Next run after this one; a failed one-shot stays due so it is retried.
fn next_slot(task: &ScheduledTask, failed: bool) -> Option<i64> {
    let Ok(schedule_type) = task.schedule_type.parse::<ScheduleType>() else {
        return None;
    };
    if failed && schedule_type == ScheduleType::Once {
        return Some(task.next_run.unwrap_or_else(unix_timestamp_ms));
    }
    match schedule::next_run(schedule_type, &task.schedule_value, Utc::now()) {
        Ok(next) => next,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Unusable schedule, completing task");
            None
        }
    }
}

fn summarize(text: &str) -> String {
    text.chars().take(RESULT_SUMMARY_CHARS).collect()
}
