//! Child process supervision

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gpulet_core::{ExecConfig, ScriptType, TaskEvent, TaskEventKind, TaskStatus};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::build_command;

/// How long to wait for pipe drains to observe EOF after the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Execution request handed to a supervisor
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Task the run belongs to
    pub task_id: Uuid,
    /// Script to execute
    pub script_path: PathBuf,
    /// Decides the interpreter
    pub script_type: ScriptType,
    /// Devices already reserved for the task
    pub devices: Vec<u32>,
    /// Wall-clock timeout, measured from process start
    pub timeout_secs: u64,
}

/// Terminal result of supervising one script run
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Always one of the terminal task statuses
    pub status: TaskStatus,
    /// Child exit code, when it exited normally
    pub exit_code: Option<i32>,
    /// Bounded head of the child's combined stdout and stderr
    pub output_head: String,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
    /// Failure diagnostic, when the run did not succeed
    pub error: Option<String>,
}

/// Child process phases, tracked for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    /// Process created, pipes not yet attached
    Spawned,
    /// Process running under supervision
    Running,
    /// Process exited on its own
    Exited,
    /// Process was terminated by the supervisor
    Killed,
}

/// Supervision seam between the scheduler and the operating system
#[async_trait]
pub trait Supervise: Send + Sync {
    /// Run the script to completion, enforcing timeout and cancellation.
    ///
    /// Never mutates allocator state; devices come in already reserved and
    /// the outcome flows back to the scheduler for release.
    async fn run(&self, request: ExecRequest, cancel: CancellationToken) -> Outcome;
}

/// Supervisor running scripts as real child processes
pub struct ProcessSupervisor {
    config: ExecConfig,
    events: broadcast::Sender<TaskEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor emitting lifecycle events on the given channel
    pub fn new(config: ExecConfig, events: broadcast::Sender<TaskEvent>) -> Self {
        Self { config, events }
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn run(&self, request: ExecRequest, cancel: CancellationToken) -> Outcome {
        let start = Instant::now();
        let mut cmd = build_command(
            &request.script_path,
            request.script_type,
            &request.devices,
            &self.config,
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "Failed to spawn child");
                return Outcome {
                    status: TaskStatus::Failed,
                    exit_code: None,
                    output_head: String::new(),
                    elapsed: start.elapsed(),
                    error: Some(spawn_error_message(&e)),
                };
            }
        };

        let mut phase = ProcessPhase::Spawned;
        if let Some(pid) = child.id() {
            debug!(task_id = %request.task_id, pid, phase = ?phase, "Child process spawned");
            let _ = self.events.send(TaskEvent::new(
                request.task_id,
                request.script_type,
                TaskEventKind::ProcessStarted { pid },
            ));
        }

        let output = Arc::new(Mutex::new(CaptureBuf::default()));
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain_into(stdout, Arc::clone(&output), self.config.output_cap_bytes));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain_into(stderr, Arc::clone(&output), self.config.output_cap_bytes));
        }

        phase = ProcessPhase::Running;
        let timeout = Duration::from_secs(request.timeout_secs);
        let grace = Duration::from_secs(self.config.kill_grace_secs);

        let (status, exit_code, error) = tokio::select! {
            result = child.wait() => match result {
                Ok(exit) => {
                    phase = ProcessPhase::Exited;
                    classify_exit(exit)
                }
                Err(e) => {
                    phase = ProcessPhase::Exited;
                    (TaskStatus::Failed, None, Some(format!("wait failed: {e}")))
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    task_id = %request.task_id,
                    timeout_secs = request.timeout_secs,
                    "Timeout expired, terminating process group"
                );
                terminate_group(&mut child, grace).await;
                phase = ProcessPhase::Killed;
                (
                    TaskStatus::Timeout,
                    None,
                    Some(format!("timed out after {}s", request.timeout_secs)),
                )
            }
            _ = cancel.cancelled() => {
                info!(task_id = %request.task_id, "Cancellation requested, terminating process group");
                terminate_group(&mut child, grace).await;
                phase = ProcessPhase::Killed;
                (TaskStatus::Cancelled, None, Some("cancelled".to_string()))
            }
        };

        for handle in drains {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
        }
        let output_head = output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .render();

        let outcome = Outcome {
            status,
            exit_code,
            output_head,
            elapsed: start.elapsed(),
            error,
        };
        info!(
            task_id = %request.task_id,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            phase = ?phase,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Supervision finished"
        );
        outcome
    }
}

fn classify_exit(exit: std::process::ExitStatus) -> (TaskStatus, Option<i32>, Option<String>) {
    match exit.code() {
        Some(0) => (TaskStatus::Success, Some(0), None),
        Some(code) => (
            TaskStatus::Failed,
            Some(code),
            Some(format!("exited with code {code}")),
        ),
        None => {
            #[cfg(unix)]
            let error = {
                use std::os::unix::process::ExitStatusExt;
                match exit.signal() {
                    Some(signal) => format!("terminated by signal {signal}"),
                    None => "terminated abnormally".to_string(),
                }
            };
            #[cfg(not(unix))]
            let error = "terminated abnormally".to_string();
            (TaskStatus::Failed, None, Some(error))
        }
    }
}

fn spawn_error_message(e: &io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => format!("interpreter or script not found: {e}"),
        io::ErrorKind::PermissionDenied => format!("permission denied: {e}"),
        _ => format!("spawn failed: {e}"),
    }
}

/// SIGTERM the child's process group, escalate to SIGKILL after the grace
/// period, and reap the child
#[cfg(unix)]
async fn terminate_group(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM to process group failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "Grace period expired, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}

/// Bounded buffer collecting the head of the child's combined output
#[derive(Default)]
struct CaptureBuf {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CaptureBuf {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        if self.bytes.len() >= cap {
            self.truncated = true;
            return;
        }
        let room = cap - self.bytes.len();
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// Drain a pipe into the shared buffer, reading past the cap and discarding
/// so the child never blocks on a full pipe
fn drain_into<R>(
    mut reader: R,
    buf: Arc<Mutex<CaptureBuf>>,
    cap: usize,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(&chunk[..n], cap);
                }
            }
        }
    })
}
