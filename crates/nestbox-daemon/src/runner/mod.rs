//! Container Runner.
//!
//! Turns one "run a turn" request into a supervised subprocess: builds the
//! input document, launches the agent through a [`SandboxBackend`], streams
//! output blocks as they are parsed, enforces the wall-clock deadline and the
//! output cap, and classifies how the run ended.

mod backend;
mod mounts;
mod secrets;
mod supervisor;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nestbox_core::Config;
use nestbox_core::config::SecretDelivery;
use nestbox_core::protocol::{ExecutionInput, OutputBlock, Secrets};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backend::{DirectBackend, DockerBackend, LaunchSpec, SandboxBackend, backend_from_config};
pub use mounts::{EXTRA_MOUNT_ROOT, GROUP_MOUNT, IPC_MOUNT, Mount, SECRETS_MOUNT, plan_mounts};
pub use secrets::{ALLOWED_KEYS, SecretFile, load_secrets, parse_secrets};

use crate::storage::ContainerConfig;

/// Errors raised before an execution is running.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn agent: {0}")]
    Spawn(String),

    #[error("Sandbox backend error: {0}")]
    Backend(String),

    #[error("Invalid mount: {0}")]
    InvalidMount(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] nestbox_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Every reply failed to reach the transport.
    TransportDisconnected,
    /// Killed by the wall-clock deadline.
    Timeout,
    /// Non-zero exit, death by signal, or a forced kill.
    Crash { exit_code: Option<i32> },
    /// Stopped early for writing too much output. Counts as a crash.
    OutputLimitExceeded,
}

impl ExecutionFailure {
    pub const fn is_crash(&self) -> bool {
        matches!(self, Self::Crash { .. } | Self::OutputLimitExceeded)
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportDisconnected => write!(f, "transport disconnected"),
            Self::Timeout => write!(f, "timed out"),
            Self::Crash {
                exit_code: Some(code),
            } => write!(f, "crashed with exit code {code}"),
            Self::Crash { exit_code: None } => write!(f, "crashed"),
            Self::OutputLimitExceeded => write!(f, "output limit exceeded"),
        }
    }
}

/// How a finished execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub failure: Option<ExecutionFailure>,
    pub exit_code: Option<i32>,
    /// Bytes read from the agent's standard output.
    pub output_bytes: usize,
    pub blocks: u64,
    pub duration: Duration,
}

impl RunOutcome {
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// One turn to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Secrets are filled in by the runner.
    pub input: ExecutionInput,
    pub group_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub container_config: ContainerConfig,
}

/// Limits and delivery options shared by every execution.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub terminate_grace: Duration,
    pub secret_delivery: SecretDelivery,
    pub secrets_path: PathBuf,
    /// Host directory for per-run scratch files such as secret documents.
    pub scratch_dir: PathBuf,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.execution.timeout(),
            max_output_bytes: config.execution.max_output_bytes,
            terminate_grace: config.execution.terminate_grace(),
            secret_delivery: config.execution.secret_delivery,
            secrets_path: config.paths.secrets_file(),
            scratch_dir: config.paths.data_dir.join("run"),
        }
    }
}

/// Out-of-band control over a live execution.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    session_id: String,
    kill_tx: Arc<watch::Sender<bool>>,
}

impl ExecutionControl {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Kill immediately, skipping the graceful stop.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }
}

/// A launched execution.
#[derive(Debug)]
pub struct RunningExecution {
    pub control: ExecutionControl,
    /// Blocks in emission order; closes when the agent's output ends.
    pub blocks: mpsc::Receiver<OutputBlock>,
    completion: JoinHandle<RunOutcome>,
}

impl RunningExecution {
    /// Wait for the process to be gone and return its classification.
    pub async fn outcome(self) -> RunOutcome {
        match self.completion.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %self.control.session_id, error = %e, "Supervisor task failed");
                RunOutcome {
                    failure: Some(ExecutionFailure::Crash { exit_code: None }),
                    exit_code: None,
                    output_bytes: 0,
                    blocks: 0,
                    duration: Duration::ZERO,
                }
            }
        }
    }
}

/// Launches and supervises agent executions.
#[derive(Clone)]
pub struct ContainerRunner {
    backend: Arc<dyn SandboxBackend>,
    settings: RunnerSettings,
}

impl ContainerRunner {
    pub fn new(backend: Arc<dyn SandboxBackend>, settings: RunnerSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Prepare the sandbox before the first launch.
    pub async fn prepare(&self) -> Result<(), RunnerError> {
        std::fs::create_dir_all(&self.settings.scratch_dir)?;
        self.backend.prepare().await
    }

    /// Start one execution.
    pub async fn launch(&self, request: RunRequest) -> Result<RunningExecution, RunnerError> {
        let RunRequest {
            mut input,
            group_dir,
            ipc_dir,
            container_config,
        } = request;
        let started = Instant::now();
        let name = execution_name(&input.group_folder);

        let secrets = load_secrets(&self.settings.secrets_path)?;
        let secret_count = secrets.len();
        let secret_file = match self.settings.secret_delivery {
            SecretDelivery::Inline => {
                input.secrets = secrets;
                None
            }
            SecretDelivery::File if secrets.is_empty() => None,
            SecretDelivery::File => {
                input.secrets = Secrets::new();
                let path = self.settings.scratch_dir.join(format!("{name}.secrets.json"));
                Some(SecretFile::write(path, &secrets)?)
            }
        };

        std::fs::create_dir_all(&group_dir)?;
        let mounts = plan_mounts(
            &group_dir,
            &ipc_dir,
            secret_file.as_ref().map(SecretFile::path),
            &container_config.additional_mounts,
        )?;
        let spec = LaunchSpec {
            name,
            group_folder: input.group_folder.clone(),
            group_dir,
            ipc_dir,
            mounts,
            secrets_file: secret_file.as_ref().map(|f| f.path().to_path_buf()),
        };

        let bytes = input.to_bytes()?;
        let mut cmd = self.backend.command(&spec);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            group = %spec.group_folder,
            session_id = %input.session_id,
            execution = %spec.name,
            backend = self.backend.name(),
            scheduled = input.is_scheduled_task,
            secrets = secret_count,
            "Launching agent"
        );
        debug!(input = ?input.without_secrets(), "Execution input");

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Spawn("Failed to capture stdin".to_string()))?;
        let group = spec.group_folder.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&bytes).await {
                warn!(group = %group, error = %e, "Failed to write execution input");
            }
            // Dropping stdin closes it; later turns use the input directory.
        });

        let (blocks_tx, blocks_rx) = mpsc::channel(64);
        let (kill_tx, kill_rx) = watch::channel(false);
        let timeout = container_config
            .timeout_secs
            .map_or(self.settings.timeout, Duration::from_secs);
        let limits = supervisor::Limits {
            deadline: started + timeout,
            max_output_bytes: self.settings.max_output_bytes,
            terminate_grace: self.settings.terminate_grace,
        };

        let completion = tokio::spawn(supervisor::supervise(
            child,
            spec,
            Arc::clone(&self.backend),
            limits,
            blocks_tx,
            kill_rx,
            secret_file,
            started,
        ));

        Ok(RunningExecution {
            control: ExecutionControl {
                session_id: input.session_id,
                kill_tx: Arc::new(kill_tx),
            },
            blocks: blocks_rx,
            completion,
        })
    }
}

fn execution_name(group_folder: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("nestbox-{group_folder}-{}", &suffix[..8])
}
