//! Sandbox backends.
//!
//! A backend knows how to turn a [`LaunchSpec`] into a process and how to
//! stop it. The supervisor owns everything else (stdin, output parsing,
//! deadlines), so backends stay small and interchangeable.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nestbox_core::config::{BackendKind, ExecutionConfig};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::RunnerError;
use super::mounts::Mount;

/// Everything a backend needs to start one execution.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Unique per execution; used as the container name.
    pub name: String,
    pub group_folder: String,
    pub group_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub secrets_file: Option<PathBuf>,
}

/// Capability interface over container engines and plain processes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the backend is usable before the first launch.
    async fn prepare(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Build the command for one execution. Stdio is configured by the caller.
    fn command(&self, spec: &LaunchSpec) -> Command;

    /// Ask the execution to stop.
    async fn terminate(&self, spec: &LaunchSpec, pid: Option<u32>);

    /// Clean up after the local process was killed.
    async fn force_kill(&self, _spec: &LaunchSpec) {}
}

/// Select the backend named in the configuration.
pub fn backend_from_config(config: &ExecutionConfig) -> Result<Box<dyn SandboxBackend>, RunnerError> {
    match config.backend {
        BackendKind::Docker => Ok(Box::new(DockerBackend::new(
            config.image.clone(),
            config.terminate_grace(),
        ))),
        BackendKind::Direct => Ok(Box::new(DirectBackend::new(config.agent_command.clone())?)),
    }
}

/// Runs each execution in a throwaway Docker container.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
    image: String,
    stop_grace: Duration,
}

impl DockerBackend {
    pub fn new(image: String, stop_grace: Duration) -> Self {
        Self {
            program: "docker".to_string(),
            image,
            stop_grace,
        }
    }

    /// Arguments passed to `docker`, exposed for inspection.
    pub fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        args.push(self.image.clone());
        args
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output, RunnerError> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunnerError::Backend(format!("failed to run {}: {e}", self.program)))
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare(&self) -> Result<(), RunnerError> {
        let output = self.docker(&["image", "inspect", &self.image]).await?;
        if !output.status.success() {
            return Err(RunnerError::Backend(format!(
                "sandbox image '{}' is not available",
                self.image
            )));
        }
        info!(image = %self.image, "Sandbox image ready");
        Ok(())
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.run_args(spec));
        cmd
    }

    async fn terminate(&self, spec: &LaunchSpec, _pid: Option<u32>) {
        let grace = self.stop_grace.as_secs().to_string();
        match self.docker(&["stop", "-t", &grace, &spec.name]).await {
            Ok(output) if output.status.success() => {
                debug!(container = %spec.name, "Container stopped");
            }
            Ok(output) => warn!(
                container = %spec.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker stop failed"
            ),
            Err(e) => warn!(container = %spec.name, error = %e, "docker stop failed"),
        }
    }

    async fn force_kill(&self, spec: &LaunchSpec) {
        if let Err(e) = self.docker(&["kill", &spec.name]).await {
            warn!(container = %spec.name, error = %e, "docker kill failed");
        }
    }
}

/// Runs the agent as a plain child process with a scrubbed environment.
///
/// No isolation beyond the working directory; intended for development and
/// tests.
#[derive(Debug, Clone)]
pub struct DirectBackend {
    program: String,
    args: Vec<String>,
}

impl DirectBackend {
    pub fn new(command: Vec<String>) -> Result<Self, RunnerError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| RunnerError::Backend("agent command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl SandboxBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&spec.group_dir)
            .env_clear()
            .env("NESTBOX_GROUP_DIR", &spec.group_dir)
            .env("NESTBOX_IPC_DIR", &spec.ipc_dir)
            .env("NESTBOX_INPUT_DIR", spec.ipc_dir.join("input"));
        for key in ["PATH", "HOME"] {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        if let Some(path) = &spec.secrets_file {
            cmd.env("NESTBOX_SECRETS_FILE", path);
        }
        cmd
    }

    async fn terminate(&self, spec: &LaunchSpec, pid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            // SAFETY: pid comes from our own Child handle; kill(2) with
            // SIGTERM has no memory-safety requirements.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(process = %spec.name, pid, error = %err, "Failed to send SIGTERM");
            }
        }
        #[cfg(not(unix))]
        let _ = (spec, pid);
    }
}
