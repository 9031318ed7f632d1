use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::stream::StreamExt;
use tokio::sync::OnceCell;
use tokio::time::{Instant, timeout_at};

use crate::config::{BackendKind, ContainerConfig};
use crate::language::{Language, Step};
use crate::limits::ResourceLimits;

use super::capture::CappedBuffer;
use super::{
    BareBackend, ExecutionResult, SandboxBackend, SandboxError, SandboxRequest, StepOutcome,
    StepRunner, WORKSPACE_ALIAS,
};

/// File inside the workspace fed to the step as stdin
const STDIN_FILE: &str = ".stdin";

/// What the one-time probe found out
enum Availability {
    Ready {
        docker: Docker,
        runtime: Option<String>,
    },
    /// No usable daemon, fallback explicitly allowed
    Bare(BareBackend),
    Unavailable(String),
}

/// Runs every step in a fresh container with the workspace bind-mounted.
///
/// The container has no network, a read-only root filesystem and memory, CPU
/// and pid caps. When `runtime` is set (e.g. gVisor's `runsc`) the daemon must
/// have it registered.
pub struct ContainerBackend {
    config: ContainerConfig,
    allow_fallback: bool,
    availability: OnceCell<Availability>,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig, allow_fallback: bool) -> Self {
        Self {
            config,
            allow_fallback,
            availability: OnceCell::new(),
        }
    }

    fn image_for(&self, language: Language) -> String {
        self.config
            .images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.default_image().to_string())
    }

    async fn availability(&self) -> &Availability {
        self.availability.get_or_init(|| self.detect()).await
    }

    async fn detect(&self) -> Availability {
        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => docker,
            Err(e) => return self.daemon_missing(&e.to_string()),
        };
        if let Err(e) = docker.ping().await {
            return self.daemon_missing(&e.to_string());
        }

        let Some(name) = self.config.runtime.clone() else {
            log::info!("Container runtime available (default OCI runtime)");
            return Availability::Ready {
                docker,
                runtime: None,
            };
        };

        let registered = match docker.info().await {
            Ok(info) => info.runtimes.is_some_and(|r| r.contains_key(&name)),
            Err(e) => {
                log::warn!("Failed to query container runtimes: {e}");
                false
            }
        };

        if registered {
            log::info!("Container runtime available (runtime: {name})");
            Availability::Ready {
                docker,
                runtime: Some(name),
            }
        } else if self.allow_fallback {
            log::warn!(
                "Runtime {name} is not registered with the daemon, falling back to the default runtime"
            );
            Availability::Ready {
                docker,
                runtime: None,
            }
        } else {
            Availability::Unavailable(format!(
                "Container runtime '{name}' is not registered with the Docker daemon. \
                 Install it (for gVisor: `runsc install` followed by a daemon restart), \
                 remove `container.runtime` from the configuration, \
                 or set `engine.allow_fallback_backend` to use the default runtime."
            ))
        }
    }

    fn daemon_missing(&self, reason: &str) -> Availability {
        if self.allow_fallback {
            log::warn!(
                "Docker daemon unavailable ({reason}), falling back to bare subprocess execution"
            );
            Availability::Bare(BareBackend::new())
        } else {
            Availability::Unavailable(format!(
                "Docker daemon is not reachable ({reason}). \
                 Start Docker and make sure this process can access its socket, \
                 or set `engine.allow_fallback_backend` to run without container isolation."
            ))
        }
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ContainerRuntime
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        match self.availability().await {
            Availability::Unavailable(reason) => Err(SandboxError::Unavailable(reason.clone())),
            _ => Ok(()),
        }
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        match self.availability().await {
            Availability::Unavailable(reason) => Err(SandboxError::Unavailable(reason.clone())),
            Availability::Bare(bare) => bare.run(request).await,
            Availability::Ready { docker, runtime } => {
                let image = self.image_for(request.plan.language);
                ensure_image(docker, &image).await?;
                let steps = DockerSteps {
                    docker,
                    image,
                    runtime: runtime.as_deref(),
                    workspace: request.workspace.to_string_lossy().into_owned(),
                };
                super::run_plan(&steps, &request).await
            }
        }
    }
}

/// Container cleanup guard - removes the container when dropped, whichever
/// way the step ends
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                log::warn!("Failed to remove container {container_id}: {e}");
            }
        });
    }
}

/// Pulls `image` unless it is already present
async fn ensure_image(docker: &Docker, image: &str) -> Result<(), SandboxError> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    log::warn!("Image {image} not present, pulling");
    let options = Some(CreateImageOptions {
        from_image: image,
        ..Default::default()
    });
    let mut stream = docker.create_image(options, None, None);
    while let Some(progress) = stream.next().await {
        progress?;
    }
    log::info!("Image {image} pulled");
    Ok(())
}

struct DockerSteps<'a> {
    docker: &'a Docker,
    image: String,
    runtime: Option<&'a str>,
    /// Host path of the workspace, mounted at [`WORKSPACE_ALIAS`]
    workspace: String,
}

impl DockerSteps<'_> {
    fn container_config(&self, step: &Step, limits: &ResourceLimits) -> Config<String> {
        let command = format!("exec {} < {STDIN_FILE}", step.to_shell());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,nosuid,size=64m".to_string());

        let memory = limits.memory_bytes.map(|b| b as i64);
        let nano_cpus = limits.cpu_limit.map(|c| (c as f64 * 1_000_000_000.0) as i64);

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
            working_dir: Some(WORKSPACE_ALIAS.to_string()),
            user: Some(host_user()),
            env: Some(vec!["HOME=/tmp".to_string(), "LANG=C.UTF-8".to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{WORKSPACE_ALIAS}", self.workspace)]),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                memory,
                memory_swap: memory,
                nano_cpus,
                pids_limit: Some(128),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                runtime: self.runtime.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StepRunner for DockerSteps<'_> {
    async fn run_step(
        &self,
        step: &Step,
        stdin: &str,
        wall_clock: Duration,
        limits: &ResourceLimits,
    ) -> Result<StepOutcome, SandboxError> {
        tokio::fs::write(step.working_dir.join(STDIN_FILE), stdin).await?;

        let name = format!("assessd-{}", uuid::Uuid::new_v4());
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(options), self.container_config(step, limits))
            .await?;
        let container_id = container.id;
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let start_time = std::time::Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;
        let deadline = Instant::now() + wall_clock;

        let mut stdout = CappedBuffer::new(limits.max_output_bytes);
        let mut stderr = CappedBuffer::new(limits.max_output_bytes);
        let mut timed_out = false;

        let logs_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(&container_id, Some(logs_options));
        loop {
            match timeout_at(deadline, logs.next()).await {
                Ok(Some(Ok(LogOutput::StdOut { message }))) => stdout.push(&message),
                Ok(Some(Ok(LogOutput::StdErr { message }))) => stderr.push(&message),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    log::warn!("Error reading container logs: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let mut exit_code = None;
        if !timed_out {
            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&container_id, Some(wait_options));
            match timeout_at(deadline, wait.next()).await {
                Ok(Some(Ok(response))) => exit_code = Some(response.status_code as i32),
                // Non-zero exits are reported as errors by the wait endpoint
                Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                    exit_code = Some(code as i32)
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => log::warn!("No wait response from container {container_id}"),
                Err(_) => timed_out = true,
            }
        }
        let elapsed = start_time.elapsed();

        if timed_out {
            log::debug!(
                "Container {container_id} exceeded {} ms, killing",
                wall_clock.as_millis()
            );
            if let Err(e) = self
                .docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await
            {
                log::warn!("Failed to kill timed out container {container_id}: {e}");
            }
        }

        let mut stderr = stderr.into_string();
        if exit_code == Some(137) && !timed_out {
            stderr.push_str("\n[killed: memory limit exceeded]");
        }

        Ok(StepOutcome {
            stdout: stdout.into_string(),
            stderr,
            exit_code,
            elapsed,
            timed_out,
            memory_used_bytes: None,
        })
    }
}

/// Steps run as the uid owning the workspace so they can write artifacts to it
#[cfg(unix)]
fn host_user() -> String {
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    format!("{uid}:{gid}")
}

#[cfg(not(unix))]
fn host_user() -> String {
    "65534:65534".to_string()
}
