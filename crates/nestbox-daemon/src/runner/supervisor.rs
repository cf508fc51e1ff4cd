//! Supervision of one running agent process.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nestbox_core::protocol::{OutputBlock, OutputParser};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::backend::{LaunchSpec, SandboxBackend};
use super::secrets::SecretFile;
use super::{ExecutionFailure, RunOutcome};

const READ_CHUNK: usize = 8 * 1024;

pub(super) struct Limits {
    pub deadline: Instant,
    pub max_output_bytes: usize,
    pub terminate_grace: Duration,
}

/// Why the read loop stopped before end of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Deadline,
    OutputLimit,
    Killed,
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
pub(super) async fn supervise(
    mut child: Child,
    spec: LaunchSpec,
    backend: Arc<dyn SandboxBackend>,
    limits: Limits,
    blocks_tx: mpsc::Sender<OutputBlock>,
    mut kill_rx: watch::Receiver<bool>,
    secret_file: Option<SecretFile>,
    started: Instant,
) -> RunOutcome {
    let group = spec.group_folder.clone();

    if let Some(stderr) = child.stderr.take() {
        let group = group.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(group = %group, "agent stderr: {}", line);
            }
        });
    }

    let deadline = tokio::time::sleep_until(limits.deadline.into());
    tokio::pin!(deadline);

    let mut parser = OutputParser::new();
    let mut sequence = 0u64;
    let mut output_bytes = 0usize;
    let mut stop = None;
    let mut kill_open = true;

    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => {
                    stop = Some(Stop::Deadline);
                    break;
                }
                changed = kill_rx.changed(), if kill_open => {
                    if changed.is_err() {
                        kill_open = false;
                    } else if *kill_rx.borrow() {
                        stop = Some(Stop::Killed);
                        break;
                    }
                }
                read = stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(group = %group, error = %e, "Failed to read agent output");
                            break;
                        }
                    };
                    output_bytes += n;
                    if output_bytes > limits.max_output_bytes {
                        warn!(
                            group = %group,
                            output_bytes,
                            limit = limits.max_output_bytes,
                            "Agent exceeded output limit"
                        );
                        stop = Some(Stop::OutputLimit);
                        break;
                    }
                    for text in parser.feed(&buf[..n]) {
                        sequence += 1;
                        debug!(group = %group, sequence, len = text.len(), "Output block");
                        // A dropped receiver only means nobody forwards blocks.
                        let _ = blocks_tx.send(OutputBlock { sequence, text }).await;
                    }
                }
            }
        }
    }
    drop(blocks_tx);

    if stop.is_none() {
        stop = wait_for_exit(&mut child, &mut deadline, &mut kill_rx, kill_open).await;
    }

    let status = match stop {
        None => child.wait().await.ok(),
        Some(Stop::Killed) => {
            warn!(group = %group, execution = %spec.name, "Killing agent");
            force_kill(&mut child, &spec, backend.as_ref()).await
        }
        Some(reason) => {
            if reason == Stop::Deadline {
                warn!(group = %group, execution = %spec.name, "Agent hit its deadline");
            }
            stop_gracefully(&mut child, &spec, backend.as_ref(), limits.terminate_grace).await
        }
    };

    if let Some(partial) = parser.finish() {
        warn!(group = %group, len = partial.len(), "Discarding unterminated output block");
    }
    drop(secret_file);

    let exit_code = status.and_then(|s| s.code());
    let failure = match stop {
        Some(Stop::Deadline) => Some(ExecutionFailure::Timeout),
        Some(Stop::OutputLimit) => Some(ExecutionFailure::OutputLimitExceeded),
        Some(Stop::Killed) => Some(ExecutionFailure::Crash { exit_code }),
        None => match status {
            Some(s) if s.success() => None,
            _ => Some(ExecutionFailure::Crash { exit_code }),
        },
    };

    let duration = started.elapsed();
    match failure {
        None => info!(
            group = %group,
            blocks = sequence,
            output_bytes,
            duration_ms = duration.as_millis(),
            "Agent exited cleanly"
        ),
        Some(failure) => warn!(
            group = %group,
            blocks = sequence,
            output_bytes,
            exit_code = ?exit_code,
            duration_ms = duration.as_millis(),
            reason = %failure,
            "Agent execution failed"
        ),
    }

    RunOutcome {
        failure,
        exit_code,
        output_bytes,
        blocks: sequence,
        duration,
    }
}

/// Output has ended; wait for the process itself, still honouring the
/// deadline and kill requests.
async fn wait_for_exit(
    child: &mut Child,
    deadline: &mut std::pin::Pin<&mut tokio::time::Sleep>,
    kill_rx: &mut watch::Receiver<bool>,
    mut kill_open: bool,
) -> Option<Stop> {
    loop {
        tokio::select! {
            biased;
            () = deadline.as_mut() => return Some(Stop::Deadline),
            changed = kill_rx.changed(), if kill_open => {
                if changed.is_err() {
                    kill_open = false;
                } else if *kill_rx.borrow() {
                    return Some(Stop::Killed);
                }
            }
            _ = child.wait() => return None,
        }
    }
}

async fn stop_gracefully(
    child: &mut Child,
    spec: &LaunchSpec,
    backend: &dyn SandboxBackend,
    grace: Duration,
) -> Option<ExitStatus> {
    backend.terminate(spec, child.id()).await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(execution = %spec.name, error = %e, "Error waiting for agent");
            force_kill(child, spec, backend).await
        }
        Err(_) => {
            warn!(execution = %spec.name, "Agent ignored termination, killing");
            force_kill(child, spec, backend).await
        }
    }
}

async fn force_kill(
    child: &mut Child,
    spec: &LaunchSpec,
    backend: &dyn SandboxBackend,
) -> Option<ExitStatus> {
    if let Err(e) = child.kill().await {
        warn!(execution = %spec.name, error = %e, "Failed to kill agent");
    }
    backend.force_kill(spec).await;
    child.wait().await.ok()
}
