//! Orchestrator: the control loop.
//!
//! A single task drives three timers (message poll, Command Bus scan, task
//! scheduler) and the inbound event stream. Executions run on the
//! [`ExecutionQueue`]; nothing on the control path waits on a subprocess.
//!
//! Lifecycle: `Initializing → Recovering → Polling`, then
//! `ShuttingDown → Stopped` on a termination signal. Per group, polling
//! moves through `Processing` (queued) and `Executing` (live handle).

mod context;
mod cursor;
mod retry;
mod state;
mod turn;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nestbox_core::Config;
use nestbox_core::protocol::ContinuationMessage;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub use context::{format_messages, strip_internal};
pub use cursor::{CursorGuard, CursorTable};
pub use retry::{RetryDecision, RetryTracker};
pub use state::{GroupPhase, OrchestratorState, StateCell};
pub use turn::{
    ActiveHandle, ActiveHandles, ClosePolicy, Delivery, MAX_BATCH, classify, forward_blocks,
};

use crate::channel::{ChannelEvent, ChannelRouter, Ingestor};
use crate::groups::{GroupRegistry, should_trigger};
use crate::ipc::{BusSettings, CommandBus, IpcError, IpcLayout, ScanReport};
use crate::queue::{ExecutionQueue, QueueError};
use crate::runner::ContainerRunner;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{Database, DatabaseError, RegisteredGroup};

/// Capacity of the inbound event channel shared by all transports.
const EVENT_BUFFER: usize = 256;

/// Extra wait after force-killing stragglers, so supervisors can reap.
const KILL_REAP_WAIT: Duration = Duration::from_secs(5);

/// Errors that stop the daemon.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl From<DatabaseError> for OrchestratorError {
    fn from(e: DatabaseError) -> Self {
        Self::Fatal(format!("store unavailable: {e}"))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Fatal(format!("filesystem failure: {e}"))
    }
}

impl From<IpcError> for OrchestratorError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Store(e) => e.into(),
            IpcError::Io(e) => e.into(),
            IpcError::Protocol(e) => Self::Fatal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for OrchestratorError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(e) => e.into(),
            other => Self::Fatal(other.to_string()),
        }
    }
}

/// How shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every execution finished or was killed after the grace period.
    Graceful,
    /// A second signal cut the grace period short.
    Forced,
}

/// State shared by the control loop, turns and the scheduler.
pub struct OrchestratorContext {
    pub config: Config,
    pub db: Database,
    pub registry: Arc<GroupRegistry>,
    pub router: ChannelRouter,
    pub queue: ExecutionQueue,
    pub runner: ContainerRunner,
    pub layout: IpcLayout,
    pub bus: CommandBus,
    pub cursors: CursorTable,
    pub handles: ActiveHandles,
    pub retry: RetryTracker,
    pub state: StateCell,
    queued_turns: Mutex<HashSet<String>>,
    fatal: mpsc::UnboundedSender<OrchestratorError>,
}

impl OrchestratorContext {
    /// Mark a message turn as queued; `false` if one already is.
    fn mark_queued(&self, folder: &str) -> bool {
        self.queued_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(folder.to_string())
    }

    fn unmark_queued(&self, folder: &str) {
        self.queued_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(folder);
    }

    pub fn is_queued(&self, folder: &str) -> bool {
        self.queued_turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(folder)
    }

    /// Report an error that must stop the daemon.
    pub fn report_fatal(&self, error: OrchestratorError) {
        error!(error = %error, "Fatal error");
        let _ = self.fatal.send(error);
    }

    /// Process the commands an execution left behind.
    pub async fn scan_commands(&self, folder: &str) -> Result<(), OrchestratorError> {
        match self.bus.scan_group(folder).await {
            Ok(_) => Ok(()),
            Err(IpcError::Store(e)) => Err(e.into()),
            Err(e) => {
                warn!(group = folder, error = %e, "Command Bus scan failed");
                Ok(())
            }
        }
    }

    /// Queue a message turn for `folder` unless one is already waiting.
    pub fn submit_turn(self: &Arc<Self>, folder: &str) -> bool {
        if !self.mark_queued(folder) {
            return false;
        }
        let ctx = Arc::clone(self);
        let owned = folder.to_string();
        let work = async move {
            if let Err(e) = turn::run_message_turn(Arc::clone(&ctx), owned).await {
                ctx.report_fatal(e);
            }
        };
        match self.queue.submit(folder, work) {
            Ok(handle) => {
                state::log_group_phase(folder, GroupPhase::Processing);
                debug!(group = folder, job = handle.id(), "Message turn queued");
                true
            }
            Err(QueueError::Closed) => {
                self.unmark_queued(folder);
                debug!(group = folder, "Queue closed, turn not submitted");
                false
            }
            Err(e) => {
                self.unmark_queued(folder);
                warn!(group = folder, error = %e, "Failed to queue turn");
                false
            }
        }
    }
}

/// The daemon's control loop.
pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    scheduler: Scheduler,
    ingestor: Ingestor,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: mpsc::Receiver<ChannelEvent>,
    fatal_rx: mpsc::UnboundedReceiver<OrchestratorError>,
}

impl Orchestrator {
    /// Load persisted state and wire the components together.
    pub async fn new(
        config: Config,
        db: Database,
        router: ChannelRouter,
        runner: ContainerRunner,
    ) -> Result<Self, OrchestratorError> {
        let main_folder = config.assistant.main_group_folder.clone();
        let registry = Arc::new(GroupRegistry::load(db.clone(), &main_folder).await?);
        let cursors = CursorTable::load(db.clone()).await?;
        let layout = IpcLayout::new(config.paths.ipc_dir());
        let bus = CommandBus::new(
            layout.clone(),
            db.clone(),
            Arc::clone(&registry),
            router.clone(),
            BusSettings {
                admin_folder: main_folder,
                assistant_name: config.assistant.name.clone(),
                groups_dir: config.paths.groups_dir(),
            },
        );
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let ctx = Arc::new(OrchestratorContext {
            queue: ExecutionQueue::new(config.execution.max_concurrent),
            retry: RetryTracker::from_config(&config.retry),
            config,
            db: db.clone(),
            registry: Arc::clone(&registry),
            router,
            runner,
            layout,
            bus,
            cursors,
            handles: ActiveHandles::default(),
            state: StateCell::new(),
            queued_turns: Mutex::new(HashSet::new()),
            fatal: fatal_tx,
        });
        let ingestor = Ingestor::new(db, registry, ctx.config.assistant.name.clone());
        let scheduler = Scheduler::new(Arc::clone(&ctx));

        Ok(Self {
            ctx,
            scheduler,
            ingestor,
            events_tx,
            events_rx,
            fatal_rx,
        })
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn state(&self) -> OrchestratorState {
        self.ctx.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.ctx.state.subscribe()
    }

    /// Sender transports deliver inbound events on.
    pub fn event_sender(&self) -> mpsc::Sender<ChannelEvent> {
        self.events_tx.clone()
    }

    /// Prepare the sandbox, create directories and connect transports.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        let ctx = &self.ctx;
        ctx.runner
            .prepare()
            .await
            .map_err(|e| OrchestratorError::Init(e.to_string()))?;
        std::fs::create_dir_all(ctx.config.paths.groups_dir())?;
        std::fs::create_dir_all(ctx.layout.errors_dir())?;
        for group in ctx.registry.all().await {
            ctx.layout.ensure_group(&group.folder)?;
        }

        let connected = ctx.router.connect_all(&self.events_tx).await;
        info!(
            channels = ctx.router.channels().len(),
            connected,
            groups = ctx.registry.all().await.len(),
            backend = ctx.runner.backend_name(),
            max_concurrent = ctx.queue.max_concurrent(),
            "Orchestrator initialized"
        );
        Ok(())
    }

    /// Queue a turn for every group with messages past its cursor.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        self.ctx.state.transition(OrchestratorState::Recovering);
        let mut submitted = 0;
        for group in self.ctx.registry.all().await {
            let cursor = self.ctx.cursors.get(&group.folder).await;
            let pending = self.ctx.db.messages_since(&group.jid, cursor, 1).await?;
            if !pending.is_empty() {
                info!(group = %group.folder, cursor, "Recovering unprocessed messages");
                if self.ctx.submit_turn(&group.folder) {
                    submitted += 1;
                }
            }
        }
        Ok(submitted)
    }

    /// One pass of the message poll. Returns how many turns were queued.
    pub async fn poll_once(&self) -> Result<usize, OrchestratorError> {
        self.ctx.router.reconnect_missing(&self.events_tx).await;

        let mut submitted = 0;
        for group in self.ctx.registry.all().await {
            if !self.ctx.router.is_reachable(&group.jid) {
                continue;
            }
            if self.poll_group(&group).await? {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    async fn poll_group(&self, group: &RegisteredGroup) -> Result<bool, OrchestratorError> {
        let ctx = &self.ctx;
        let folder = group.folder.as_str();

        let mut cursor = ctx.cursors.lock(folder).await;
        let messages = ctx
            .db
            .messages_since(&group.jid, cursor.value(), MAX_BATCH)
            .await?;
        let Some(latest) = messages.last().map(|m| m.timestamp) else {
            return Ok(false);
        };
        if ctx.retry.is_blocked(folder, latest) {
            return Ok(false);
        }

        if ctx.handles.accepts_continuation(folder) {
            for message in &messages {
                let continuation = ContinuationMessage {
                    sender: message.sender.clone(),
                    sender_name: message.sender_name.clone(),
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                };
                if let Err(e) = ctx.layout.write_continuation(folder, &continuation) {
                    warn!(group = folder, error = %e, "Failed to pipe message into execution");
                    return Ok(false);
                }
            }
            cursor.advance(latest).await?;
            info!(group = folder, count = messages.len(), "Piped messages into live execution");
            return Ok(false);
        }

        if ctx.is_queued(folder) {
            return Ok(false);
        }
        if !should_trigger(group, ctx.registry.is_main(folder), &messages) {
            cursor.advance(latest).await?;
            debug!(group = folder, count = messages.len(), "No trigger, cursor advanced");
            return Ok(false);
        }
        drop(cursor);

        Ok(ctx.submit_turn(folder))
    }

    /// One Command Bus scan across every group.
    pub async fn scan_ipc_once(&self) -> Result<ScanReport, OrchestratorError> {
        Ok(self.ctx.bus.scan().await?)
    }

    /// One scheduler tick. Returns how many tasks were queued.
    pub async fn schedule_once(&self) -> Result<usize, OrchestratorError> {
        Ok(self.scheduler.tick().await?)
    }

    /// Store and route one inbound transport event.
    pub async fn handle_event(&self, event: ChannelEvent) -> Result<(), OrchestratorError> {
        Ok(self.ingestor.handle(event).await?)
    }

    /// Wait until every queued and running execution has finished.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.ctx.queue.wait_idle(timeout).await
    }

    /// Run until a termination signal arrives on `signals`.
    ///
    /// A second signal during shutdown skips the grace period.
    pub async fn run(
        &mut self,
        mut signals: mpsc::Receiver<()>,
    ) -> Result<ShutdownOutcome, OrchestratorError> {
        if let Err(e) = self.initialize().await {
            self.ctx.state.transition(OrchestratorState::Stopped);
            return Err(e);
        }
        let result = self.control_loop(&mut signals).await;
        let outcome = self.shutdown(&mut signals).await;
        result.map(|()| outcome)
    }

    async fn control_loop(
        &mut self,
        signals: &mut mpsc::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        self.recover().await?;
        self.ctx.state.transition(OrchestratorState::Polling);

        let timing = self.ctx.config.timing.clone();
        let mut poll = tokio::time::interval(timing.poll_interval());
        let mut ipc = tokio::time::interval(timing.ipc_poll_interval());
        let mut schedule = tokio::time::interval(timing.scheduler_poll_interval());
        for timer in [&mut poll, &mut ipc, &mut schedule] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                biased;
                Some(()) = signals.recv() => {
                    info!("Termination signal received");
                    return Ok(());
                }
                Some(e) = self.fatal_rx.recv() => return Err(e),
                Some(event) = self.events_rx.recv() => self.handle_event(event).await?,
                _ = ipc.tick() => {
                    self.scan_ipc_once().await?;
                }
                _ = poll.tick() => {
                    self.poll_once().await?;
                }
                _ = schedule.tick() => {
                    self.schedule_once().await?;
                }
            }
        }
    }

    /// Stop intake, ask live executions to finish, then force-kill.
    pub async fn shutdown(&self, signals: &mut mpsc::Receiver<()>) -> ShutdownOutcome {
        let ctx = &self.ctx;
        ctx.state.transition(OrchestratorState::ShuttingDown);

        let dropped = ctx.queue.close();
        let live = ctx.handles.folders();
        for folder in &live {
            if let Err(e) = ctx.layout.write_close_marker(folder) {
                warn!(group = %folder, error = %e, "Failed to write close marker");
            }
        }
        info!(live = live.len(), dropped, "Waiting for executions to finish");

        let grace = ctx.config.timing.shutdown_grace();
        let mut outcome = ShutdownOutcome::Graceful;
        let finished = tokio::select! {
            idle = ctx.queue.wait_idle(grace) => idle,
            Some(()) = signals.recv() => {
                warn!("Second signal, skipping grace period");
                outcome = ShutdownOutcome::Forced;
                false
            }
        };

        if !finished {
            let killed = ctx.handles.kill_all();
            if killed > 0 {
                warn!(killed, "Killed executions still running after grace period");
            }
            if outcome == ShutdownOutcome::Graceful
                && !ctx.queue.wait_idle(KILL_REAP_WAIT).await
            {
                warn!("Executions still running after force-kill");
            }
        }

        ctx.router.disconnect_all().await;
        ctx.db.close().await;
        ctx.state.transition(OrchestratorState::Stopped);
        outcome
    }
}
