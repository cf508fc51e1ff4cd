//! One message-driven execution, from cursor advance to rollback decision.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nestbox_core::protocol::{ExecutionInput, OutputBlock, PROTOCOL_VERSION, Secrets};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::context::{format_messages, strip_internal};
use super::retry::RetryDecision;
use super::state::{GroupPhase, log_group_phase};
use super::{OrchestratorContext, OrchestratorError};
use crate::channel::ChannelRouter;
use crate::groups::should_trigger;
use crate::ipc::{IpcError, IpcLayout};
use crate::runner::{ExecutionControl, ExecutionFailure, RunOutcome, RunRequest};
use crate::storage::{RegisteredGroup, StoredMessage};

/// Upper bound on messages pulled into one prompt.
pub const MAX_BATCH: u32 = 200;

/// Bookkeeping for one live execution.
#[derive(Debug, Clone)]
pub struct ActiveHandle {
    pub session_id: String,
    pub chat_jid: String,
    /// Message turns take follow-ups; scheduled tasks do not.
    pub accepts_continuation: bool,
    /// Set once the process has been spawned.
    pub control: Option<ExecutionControl>,
}

/// Live handles keyed by group folder; at most one per group.
#[derive(Default)]
pub struct ActiveHandles {
    inner: Mutex<HashMap<String, ActiveHandle>>,
}

impl ActiveHandles {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the group already has a live handle.
    pub fn insert(&self, folder: &str, handle: ActiveHandle) -> bool {
        let mut handles = self.lock();
        if handles.contains_key(folder) {
            return false;
        }
        handles.insert(folder.to_string(), handle);
        true
    }

    pub fn attach_control(&self, folder: &str, control: ExecutionControl) {
        if let Some(handle) = self.lock().get_mut(folder) {
            handle.control = Some(control);
        }
    }

    pub fn remove(&self, folder: &str) -> Option<ActiveHandle> {
        self.lock().remove(folder)
    }

    pub fn get(&self, folder: &str) -> Option<ActiveHandle> {
        self.lock().get(folder).cloned()
    }

    /// Stop piping follow-ups into `folder`'s handle; the run is ending.
    pub fn stop_accepting(&self, folder: &str) {
        if let Some(handle) = self.lock().get_mut(folder) {
            handle.accepts_continuation = false;
        }
    }

    pub fn accepts_continuation(&self, folder: &str) -> bool {
        self.lock()
            .get(folder)
            .is_some_and(|h| h.accepts_continuation)
    }

    pub fn folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = self.lock().keys().cloned().collect();
        folders.sort();
        folders
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force-kill every spawned execution. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let handles = self.lock();
        let mut killed = 0;
        for (folder, handle) in handles.iter() {
            if let Some(control) = &handle.control {
                warn!(group = %folder, session_id = %control.session_id(), "Force-killing execution");
                control.kill();
                killed += 1;
            }
        }
        killed
    }
}

/// When to write the close marker after output.
#[derive(Debug, Clone, Copy)]
pub struct ClosePolicy {
    /// Quiet period after the latest block.
    pub after_output: Duration,
}

/// What happened to the blocks of one execution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
    /// Blocks empty after stripping internal spans.
    pub suppressed: usize,
    pub closed_idle: bool,
    /// Text of the latest delivered block.
    pub last_text: Option<String>,
}

impl Delivery {
    /// Every attempted send failed.
    pub const fn transport_lost(&self) -> bool {
        self.failed > 0 && self.delivered == 0
    }
}

/// Forward blocks to `chat_jid` as they arrive until the stream ends.
///
/// Once a block has been seen, a quiet period of `close.after_output` writes
/// the close marker so the agent ends its run. The group's handle stops
/// taking follow-ups when the marker is written or the stream ends.
pub async fn forward_blocks(
    router: &ChannelRouter,
    layout: &IpcLayout,
    handles: &ActiveHandles,
    folder: &str,
    chat_jid: &str,
    blocks: &mut mpsc::Receiver<OutputBlock>,
    close: ClosePolicy,
) -> Delivery {
    let mut delivery = Delivery::default();
    let idle = sleep_until(Instant::now() + close.after_output);
    tokio::pin!(idle);
    let mut armed = false;

    loop {
        tokio::select! {
            block = blocks.recv() => {
                let Some(block) = block else { break };
                let text = strip_internal(&block.text);
                if text.is_empty() {
                    delivery.suppressed += 1;
                } else {
                    match router.send(chat_jid, &text).await {
                        Ok(()) => {
                            delivery.delivered += 1;
                            delivery.last_text = Some(text);
                            debug!(group = folder, sequence = block.sequence, "Block delivered");
                        }
                        Err(e) => {
                            delivery.failed += 1;
                            warn!(group = folder, chat = chat_jid, error = %e, "Failed to deliver block");
                        }
                    }
                }
                if !delivery.closed_idle {
                    idle.as_mut().reset(Instant::now() + close.after_output);
                    armed = true;
                }
            }
            () = &mut idle, if armed && !delivery.closed_idle => {
                delivery.closed_idle = true;
                handles.stop_accepting(folder);
                info!(group = folder, "Execution idle, closing turn");
                if let Err(e) = layout.write_close_marker(folder) {
                    warn!(group = folder, error = %e, "Failed to write close marker");
                }
            }
        }
    }
    handles.stop_accepting(folder);
    delivery
}

/// Final classification, folding transport loss into the runner's verdict.
pub fn classify(outcome: &RunOutcome, delivery: &Delivery) -> Option<ExecutionFailure> {
    outcome.failure.or_else(|| {
        delivery
            .transport_lost()
            .then_some(ExecutionFailure::TransportDisconnected)
    })
}

/// Run one message turn for `folder`.
///
/// Only fatal errors are returned; execution failures are handled through
/// the rollback rule.
pub async fn run_message_turn(
    ctx: Arc<OrchestratorContext>,
    folder: String,
) -> Result<(), OrchestratorError> {
    let Some(group) = ctx.registry.get(&folder).await else {
        ctx.unmark_queued(&folder);
        return Ok(());
    };
    let is_main = ctx.registry.is_main(&folder);

    let mut cursor = ctx.cursors.lock(&folder).await;
    ctx.unmark_queued(&folder);
    let previous = cursor.value();
    let messages = ctx
        .db
        .messages_since(&group.jid, previous, MAX_BATCH)
        .await?;
    let Some(latest) = messages.last().map(|m| m.timestamp) else {
        return Ok(());
    };
    if !should_trigger(&group, is_main, &messages) {
        cursor.advance(latest).await?;
        debug!(group = %folder, count = messages.len(), "No trigger, cursor advanced");
        return Ok(());
    }

    ctx.layout.ensure_group(&folder)?;
    let cleared = ctx.layout.clear_input(&folder)?;
    if cleared > 0 {
        debug!(group = %folder, cleared, "Stale continuation files removed");
    }
    cursor.advance(latest).await?;
    let session_id = uuid::Uuid::new_v4().to_string();
    ctx.handles.insert(
        &folder,
        ActiveHandle {
            session_id: session_id.clone(),
            chat_jid: group.jid.clone(),
            accepts_continuation: true,
            control: None,
        },
    );
    drop(cursor);
    log_group_phase(&folder, GroupPhase::Executing);

    let result = execute(&ctx, &group, is_main, &messages, session_id).await;

    let mut cursor = ctx.cursors.lock(&folder).await;
    ctx.handles.remove(&folder);
    let (failure, delivery) = result?;
    match failure {
        Some(failure) if delivery.delivered == 0 => {
            let seen = cursor.value();
            cursor.set(previous).await?;
            match ctx.retry.record_failure(&folder, seen) {
                RetryDecision::Backoff(delay) => warn!(
                    group = %folder,
                    reason = %failure,
                    cursor = previous,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Execution failed, cursor rolled back"
                ),
                RetryDecision::Parked => warn!(
                    group = %folder,
                    reason = %failure,
                    cursor = previous,
                    attempts = ctx.retry.attempts(&folder),
                    "Execution failed repeatedly, group parked until new messages arrive"
                ),
            }
        }
        Some(failure) => {
            ctx.retry.record_success(&folder);
            warn!(
                group = %folder,
                reason = %failure,
                delivered = delivery.delivered,
                "Execution failed after delivering output, cursor kept"
            );
        }
        None => {
            ctx.retry.record_success(&folder);
            info!(group = %folder, delivered = delivery.delivered, "Execution complete");
        }
    }

    // Follow-ups piped in as the run was ending were never read.
    match ctx.layout.oldest_unread_continuation(&folder) {
        Ok(Some(oldest)) if oldest <= cursor.value() => {
            let resume_from = oldest.saturating_sub(1);
            cursor.set(resume_from).await?;
            if let Err(e) = ctx.layout.clear_input(&folder) {
                warn!(group = %folder, error = %e, "Failed to clear unread follow-ups");
            }
            info!(group = %folder, cursor = resume_from, "Unread follow-ups left for the next turn");
        }
        Ok(_) => {}
        Err(e) => warn!(group = %folder, error = %e, "Failed to inspect continuation directory"),
    }
    drop(cursor);
    log_group_phase(&folder, GroupPhase::Idle);

    ctx.scan_commands(&folder).await
}

async fn execute(
    ctx: &OrchestratorContext,
    group: &RegisteredGroup,
    is_main: bool,
    messages: &[StoredMessage],
    session_id: String,
) -> Result<(Option<ExecutionFailure>, Delivery), OrchestratorError> {
    let folder = group.folder.as_str();
    match ctx.bus.write_snapshots(folder).await {
        Ok(()) => {}
        Err(IpcError::Store(e)) => return Err(e.into()),
        Err(e) => warn!(group = folder, error = %e, "Failed to write snapshots"),
    }

    let request = RunRequest {
        input: ExecutionInput {
            version: PROTOCOL_VERSION,
            prompt: format_messages(messages),
            session_id,
            group_folder: folder.to_string(),
            chat_jid: group.jid.clone(),
            is_main,
            is_scheduled_task: false,
            assistant_name: ctx.config.assistant.name.clone(),
            secrets: Secrets::new(),
        },
        group_dir: ctx.config.paths.groups_dir().join(folder),
        ipc_dir: ctx.layout.group_dir(folder),
        container_config: group.container_config.clone(),
    };

    let mut running = match ctx.runner.launch(request).await {
        Ok(running) => running,
        Err(e) => {
            warn!(group = folder, error = %e, "Failed to launch execution");
            return Ok((
                Some(ExecutionFailure::Crash { exit_code: None }),
                Delivery::default(),
            ));
        }
    };
    ctx.handles.attach_control(folder, running.control.clone());

    let delivery = forward_blocks(
        &ctx.router,
        &ctx.layout,
        &ctx.handles,
        folder,
        &group.jid,
        &mut running.blocks,
        ClosePolicy {
            after_output: ctx.config.execution.idle_timeout(),
        },
    )
    .await;
    let outcome = running.outcome().await;
    info!(
        group = folder,
        exit_code = ?outcome.exit_code,
        blocks = outcome.blocks,
        delivered = delivery.delivered,
        output_bytes = outcome.output_bytes,
        duration_ms = u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        "Execution ended"
    );
    Ok((classify(&outcome, &delivery), delivery))
}
