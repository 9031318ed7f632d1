use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::BackendKind;
use crate::language::Step;
use crate::limits::{Enforcement, ResourceLimits, kill_process_group};

use super::capture::{CappedBuffer, SharedBuffer, read_shared};
use super::{ExecutionResult, SandboxBackend, SandboxError, SandboxRequest, StepOutcome, StepRunner};

/// How long to wait for pipes to close after the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs steps directly on the host.
///
/// Only rlimits and the wall clock constrain the program: it shares the
/// host filesystem and network. Meant for development and as an explicit
/// fallback.
#[derive(Debug, Clone, Default)]
pub struct BareBackend;

impl BareBackend {
    pub fn new() -> Self {
        log::warn!(
            "Bare subprocess backend provides NO filesystem or network isolation - use only in trusted environments"
        );
        Self
    }

    fn program_path(step: &Step) -> PathBuf {
        // Relative programs such as `./solution` live in the working directory
        if step.program.contains('/') && !step.program.starts_with('/') {
            step.working_dir.join(&step.program)
        } else {
            PathBuf::from(&step.program)
        }
    }
}

#[async_trait]
impl StepRunner for BareBackend {
    async fn run_step(
        &self,
        step: &Step,
        stdin: &str,
        wall_clock: Duration,
        limits: &ResourceLimits,
    ) -> Result<StepOutcome, SandboxError> {
        let enforcement = Enforcement::resolve(limits, wall_clock);

        let mut cmd = Command::new(Self::program_path(step));
        cmd.args(&step.args)
            .current_dir(&step.working_dir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", &step.working_dir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        enforcement.apply(&mut cmd);

        let start_time = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id();

        // A program that never reads stdin must not make us block
        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        log::debug!("Failed to write stdin: {e}");
                    }
                }
            });
        }

        let max = limits.max_output_bytes;
        let stdout_buf = SharedBuffer::new(Mutex::new(CappedBuffer::new(max)));
        let stderr_buf = SharedBuffer::new(Mutex::new(CappedBuffer::new(max)));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_shared(out, stdout_buf.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_shared(err, stderr_buf.clone())));

        let (exit_code, timed_out) = match timeout(wall_clock, child.wait()).await {
            Ok(status) => (exit_code_of(status?), false),
            Err(_) => {
                log::debug!(
                    "Process {pid:?} exceeded {} ms, killing",
                    wall_clock.as_millis()
                );
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.kill().await;
                (None, true)
            }
        };
        let elapsed = start_time.elapsed();

        let stdout = collect(stdout_task, &stdout_buf).await;
        let stderr = collect(stderr_task, &stderr_buf).await;

        Ok(StepOutcome {
            stdout,
            stderr,
            exit_code,
            elapsed,
            timed_out,
            memory_used_bytes: None,
        })
    }
}

#[async_trait]
impl SandboxBackend for BareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BareSubprocess
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        super::run_plan(self, &request).await
    }
}

type Reader = tokio::task::JoinHandle<std::io::Result<()>>;

/// Output gathered by a reader task. A descendant that escaped the process
/// group may keep the pipe open, so the wait is bounded and whatever was read
/// before the deadline is kept.
async fn collect(task: Option<Reader>, buffer: &SharedBuffer) -> String {
    if let Some(mut task) = task {
        match timeout(DRAIN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::debug!("Failed to read process output: {e}"),
            Ok(Err(e)) => log::warn!("Output reader panicked: {e}"),
            Err(_) => {
                task.abort();
                log::debug!("Output pipe still open after process exit, keeping partial output");
            }
        }
    }
    buffer.lock().take().into_string()
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}
