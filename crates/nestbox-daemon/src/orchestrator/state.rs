//! Orchestrator lifecycle states.

use tokio::sync::watch;
use tracing::info;

/// Daemon-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    Initializing,
    Recovering,
    Polling,
    ShuttingDown,
    Stopped,
}

impl OrchestratorState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Recovering => "recovering",
            Self::Polling => "polling",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-group phase between polling and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    /// Queued, waiting for admission.
    Processing,
    /// An execution handle is live.
    Executing,
    /// Back to polling.
    Idle,
}

impl GroupPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Executing => "executing",
            Self::Idle => "idle",
        }
    }
}

pub fn log_group_phase(folder: &str, phase: GroupPhase) {
    info!(group = folder, phase = phase.as_str(), "Group phase");
}

/// Published lifecycle state.
pub struct StateCell {
    tx: watch::Sender<OrchestratorState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OrchestratorState::Initializing);
        Self { tx }
    }

    pub fn get(&self) -> OrchestratorState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.tx.subscribe()
    }

    /// Move to `next`, logging the transition. Repeated states are ignored.
    pub fn transition(&self, next: OrchestratorState) {
        let previous = self.get();
        if previous == next {
            return;
        }
        self.tx.send_replace(next);
        info!(from = %previous, to = %next, "Orchestrator state");
    }
}
