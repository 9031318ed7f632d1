mod bare;
mod capture;
mod container;
mod remote;
mod vm;

pub use bare::BareBackend;
pub use capture::{CappedBuffer, truncate_utf8};
pub use container::ContainerBackend;
pub use remote::RemoteBackend;
pub use vm::VmBackend;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BackendKind, Config};
use crate::language::{BuildPlan, Step};
use crate::limits::ResourceLimits;

/// Placeholder substituted for host workspace paths in outward text
pub const WORKSPACE_ALIAS: &str = "/workspace";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("remote execution service error: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("unexpected backend response: {0}")]
    Protocol(String),
}

/// Normalized outcome of one backend invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(rename = "output")]
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub return_code: Option<i32>,
    pub execution_time_ms: u64,
    pub memory_used_bytes: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub compile_failed: bool,
}

impl ExecutionResult {
    /// Applies the success heuristic to the raw streams of a finished program.
    ///
    /// Any non-blank stderr is a failure, even with exit code 0. With blank
    /// stderr a non-zero exit code still fails.
    pub fn from_streams(
        stdout: String,
        stderr: String,
        return_code: Option<i32>,
        elapsed: Duration,
    ) -> Self {
        let stderr_blank = stderr.trim().is_empty();
        let exited_cleanly = return_code.is_none_or(|code| code == 0);

        let error = if !stderr_blank {
            Some(stderr.trim().to_string())
        } else if !exited_cleanly {
            return_code.map(|code| format!("Process exited with code {code}"))
        } else {
            None
        };

        Self {
            success: stderr_blank && exited_cleanly,
            stdout: stdout.trim_end().to_string(),
            stderr,
            error,
            return_code,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used_bytes: None,
            timed_out: false,
            compile_failed: false,
        }
    }

    /// The program outlived `limit` and was killed; keeps whatever it printed.
    pub fn timed_out(limit: Duration, stdout: String, stderr: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            stdout: stdout.trim_end().to_string(),
            stderr,
            error: Some(format!("Execution timeout after {} ms", limit.as_millis())),
            return_code: None,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used_bytes: None,
            timed_out: true,
            compile_failed: false,
        }
    }

    pub fn compile_failure(log: String, return_code: Option<i32>, elapsed: Duration) -> Self {
        let log = log.trim().to_string();
        let error = if log.is_empty() {
            "Compilation error".to_string()
        } else {
            log.clone()
        };
        Self {
            success: false,
            stdout: String::new(),
            stderr: log,
            error: Some(error),
            return_code,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used_bytes: None,
            timed_out: false,
            compile_failed: true,
        }
    }

    /// Result for a fault of the evaluator itself rather than of the program
    pub fn internal_error(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(format!("Internal execution error: {message}")),
            ..Default::default()
        }
    }

    pub fn redact(mut self, workspace: &Path) -> Self {
        self.stdout = redact_paths(&self.stdout, workspace);
        self.stderr = redact_paths(&self.stderr, workspace);
        self.error = self.error.map(|e| redact_paths(&e, workspace));
        self
    }
}

/// Everything a backend needs for one invocation
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub plan: &'a BuildPlan,
    pub source: &'a str,
    /// Host directory holding the source file, exclusively owned by this run
    pub workspace: &'a Path,
    pub input: &'a str,
    pub limits: &'a ResourceLimits,
}

/// A way of running a build plan in isolation.
///
/// Implementations must kill the program once the wall clock runs out and
/// return what it printed so far; they never trust the child to exit.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Checks whether the backend can run programs at all. Expensive; callers
    /// should not probe per invocation.
    async fn probe(&self) -> Result<(), SandboxError>;

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError>;
}

/// Raw outcome of a single step
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub memory_used_bytes: Option<u64>,
}

/// Runs one step of a plan. Backends that execute steps one at a time on the
/// host side share [`run_plan`] through this trait.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        step: &Step,
        stdin: &str,
        timeout: Duration,
        limits: &ResourceLimits,
    ) -> Result<StepOutcome, SandboxError>;
}

/// Compile (if the plan has a compile step) and then run.
///
/// A compile step that exits non-zero, times out or leaves no artifact
/// short-circuits: the run step never executes.
pub async fn run_plan<R>(runner: &R, request: &SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError>
where
    R: StepRunner + ?Sized,
{
    let limits = request.limits;

    if let Some(compile) = &request.plan.compile {
        let outcome = runner
            .run_step(compile, "", limits.compile_wall_clock, limits)
            .await?;
        log::debug!(
            "Compile step finished in {} ms with {:?}",
            outcome.elapsed.as_millis(),
            outcome.exit_code
        );

        if outcome.timed_out {
            let mut result = ExecutionResult::compile_failure(
                outcome.stderr,
                None,
                outcome.elapsed,
            );
            result.timed_out = true;
            result.error = Some(format!(
                "Compilation timeout after {} ms",
                limits.compile_wall_clock.as_millis()
            ));
            return Ok(result.redact(request.workspace));
        }

        let artifact_missing = compile
            .artifact
            .as_ref()
            .is_some_and(|a| !compile.working_dir.join(a).exists());
        if outcome.exit_code != Some(0) || artifact_missing {
            // javac and g++ both report on stderr, fall back to stdout for others
            let log = if outcome.stderr.trim().is_empty() {
                outcome.stdout
            } else {
                outcome.stderr
            };
            let result = ExecutionResult::compile_failure(log, outcome.exit_code, outcome.elapsed);
            return Ok(result.redact(request.workspace));
        }
    }

    let outcome = runner
        .run_step(&request.plan.run, request.input, limits.wall_clock, limits)
        .await?;

    let mut result = if outcome.timed_out {
        ExecutionResult::timed_out(limits.wall_clock, outcome.stdout, outcome.stderr, outcome.elapsed)
    } else {
        ExecutionResult::from_streams(outcome.stdout, outcome.stderr, outcome.exit_code, outcome.elapsed)
    };
    result.memory_used_bytes = outcome.memory_used_bytes;

    Ok(result.redact(request.workspace))
}

/// Replaces every occurrence of the host workspace path with [`WORKSPACE_ALIAS`]
pub fn redact_paths(text: &str, workspace: &Path) -> String {
    let host = workspace.to_string_lossy();
    if host.is_empty() || !text.contains(host.as_ref()) {
        return text.to_string();
    }
    text.replace(host.as_ref(), WORKSPACE_ALIAS)
}

/// Creates the backend selected by configuration
///
/// The backend is not probed here; availability is checked lazily on first use
/// and cached by the backends that need it.
pub fn create_backend(config: &Config) -> Result<Arc<dyn SandboxBackend>, SandboxError> {
    let engine = &config.engine;
    let backend: Arc<dyn SandboxBackend> = match engine.sandbox_backend {
        BackendKind::BareSubprocess => {
            log::info!("Creating bare subprocess backend");
            Arc::new(BareBackend::new())
        }
        BackendKind::ContainerRuntime => {
            log::info!(
                "Creating container backend (runtime: {})",
                config.container.runtime.as_deref().unwrap_or("default")
            );
            Arc::new(ContainerBackend::new(
                config.container.clone(),
                engine.allow_fallback_backend,
            ))
        }
        BackendKind::IsolatedVm => {
            let vm = config.vm.clone().ok_or_else(|| {
                SandboxError::Unavailable(
                    "isolated_vm backend selected but the `vm` section is missing".to_string(),
                )
            })?;
            log::info!("Creating Firecracker backend ({})", vm.firecracker_bin.display());
            Arc::new(VmBackend::new(vm))
        }
        BackendKind::RemoteService => {
            let remote = config.remote.clone().ok_or_else(|| {
                SandboxError::Unavailable(
                    "remote_service backend selected but the `remote` section is missing"
                        .to_string(),
                )
            })?;
            log::info!("Creating remote backend ({})", remote.base_url);
            Arc::new(RemoteBackend::new(remote)?)
        }
    };
    Ok(backend)
}
