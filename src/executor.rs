use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::language::{self, Language};
use crate::limits::ResourceLimits;
use crate::sandbox::{ExecutionResult, SandboxBackend, SandboxError, SandboxRequest, redact_paths};

/// Runs one program through the configured backend in a throwaway workspace.
///
/// At most `max_concurrent_executions` backend invocations are in flight at
/// once, across every caller sharing this executor.
pub struct Executor {
    backend: Arc<dyn SandboxBackend>,
    limits: ResourceLimits,
    max_code_length: usize,
    provision_grace: Duration,
    permits: Arc<Semaphore>,
    workspace_root: PathBuf,
}

impl Executor {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            limits: ResourceLimits::from_config(config),
            max_code_length: config.max_code_length,
            provision_grace: Duration::from_millis(config.provision_grace_ms),
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            workspace_root: default_workspace_root(),
        }
    }

    /// Places workspaces under `root` instead of the user cache directory
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn check_code_length(&self, code: &str) -> Result<(), EngineError> {
        let len = code.chars().count();
        if len > self.max_code_length {
            return Err(EngineError::CodeTooLong {
                len,
                max: self.max_code_length,
            });
        }
        Ok(())
    }

    /// Runs `code` with `input` on stdin.
    ///
    /// Every failure of the program or of the sandbox plumbing comes back as a
    /// failed [`ExecutionResult`]; only an unavailable backend is an error.
    pub async fn execute(
        &self,
        code: &str,
        language: Language,
        input: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::SandboxUnavailable("executor is shut down".to_string()))?;

        let workspace = match self.allocate_workspace() {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to allocate workspace: {e}");
                return Ok(ExecutionResult::internal_error("unable to allocate workspace"));
            }
        };
        let result = self.execute_in(workspace.path(), code, language, input).await;

        if let Err(e) = workspace.close() {
            log::warn!("Failed to remove workspace: {e}");
        }
        result
    }

    async fn execute_in(
        &self,
        workspace: &Path,
        code: &str,
        language: Language,
        input: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let plan = language::resolve(language, workspace).fit_memory(self.limits.memory_mib());
        if let Err(e) = tokio::fs::write(workspace.join(&plan.source_file), code).await {
            let message = redact_paths(&e.to_string(), workspace);
            return Ok(ExecutionResult::internal_error(message));
        }

        let request = SandboxRequest {
            plan: &plan,
            source: code,
            workspace,
            input,
            limits: &self.limits,
        };

        let budget = self.limits.compile_wall_clock + self.limits.wall_clock + self.provision_grace;
        let start_time = Instant::now();
        match timeout(budget, self.backend.run(request)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(SandboxError::Unavailable(reason))) => {
                Err(EngineError::SandboxUnavailable(reason))
            }
            Ok(Err(e)) => {
                log::warn!("Sandbox failure while running {language} code: {e}");
                let message = redact_paths(&e.to_string(), workspace);
                Ok(ExecutionResult::internal_error(message))
            }
            Err(_) => {
                log::warn!(
                    "{} backend did not return within {} ms, abandoning",
                    self.backend.kind(),
                    budget.as_millis()
                );
                Ok(ExecutionResult::timed_out(
                    self.limits.wall_clock,
                    String::new(),
                    String::new(),
                    start_time.elapsed(),
                ))
            }
        }
    }

    fn allocate_workspace(&self) -> std::io::Result<TempDir> {
        std::fs::create_dir_all(&self.workspace_root)?;
        tempfile::Builder::new()
            .prefix("ws-")
            .tempdir_in(&self.workspace_root)
    }
}

fn default_workspace_root() -> PathBuf {
    use directories::ProjectDirs;

    match ProjectDirs::from("", "", "assessd") {
        Some(dirs) => dirs.cache_dir().join("workspaces"),
        None => std::env::temp_dir().join("assessd-workspaces"),
    }
}
