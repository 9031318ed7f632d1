//! Firecracker micro-VM backend.
//!
//! Each invocation boots a fresh VM from a read-only root image. The workspace
//! is copied into an ext4 image attached as a second drive, together with a
//! generated `.assess/plan.sh`. The root image's `/sbin/assess-init` is expected
//! to mount that drive at `/workspace`, run the script and power off.
//!
//! The script reports through the serial console with framed blocks:
//!
//! ```text
//! @@assess:stage run
//! @@assess:stdout
//! <base64>
//! @@assess:end
//! @@assess:stderr
//! <base64>
//! @@assess:end
//! @@assess:exit 0
//! ```
//!
//! A stage killed by its in-guest timeout reports `@@assess:timeout` before
//! its exit line. Anything outside a frame (kernel messages) is ignored.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::config::{BackendKind, VmConfig};
use crate::language::{BuildPlan, shell_quote};
use crate::limits::ResourceLimits;

use super::capture::read_capped;
use super::{ExecutionResult, SandboxBackend, SandboxError, SandboxRequest, WORKSPACE_ALIAS};

const DEFAULT_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off quiet loglevel=0 init=/sbin/assess-init";

/// Time allowed for boot and shutdown on top of the step timeouts
const BOOT_GRACE: Duration = Duration::from_secs(10);

const WORKSPACE_IMAGE_SIZE: &str = "256M";
const MIN_GUEST_MEMORY_MIB: u64 = 128;

pub struct VmBackend {
    config: VmConfig,
    availability: OnceCell<Result<(), String>>,
}

impl VmBackend {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            availability: OnceCell::new(),
        }
    }

    async fn check_available(&self) -> Result<(), SandboxError> {
        self.availability
            .get_or_init(|| self.detect())
            .await
            .clone()
            .map_err(SandboxError::Unavailable)
    }

    async fn detect(&self) -> Result<(), String> {
        for (what, path) in [
            ("firecracker binary", &self.config.firecracker_bin),
            ("kernel image", &self.config.kernel_image),
            ("root filesystem image", &self.config.rootfs_image),
        ] {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(format!(
                    "Firecracker {what} not found at {}. Fix the `vm` section of the configuration.",
                    path.display()
                ));
            }
        }

        if let Err(e) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
        {
            return Err(format!(
                "/dev/kvm is not accessible ({e}). Enable KVM and add this user to the `kvm` group."
            ));
        }

        let mke2fs = Command::new("mke2fs")
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !mke2fs.is_ok_and(|status| status.success()) {
            return Err("mke2fs not found. Install e2fsprogs 1.43 or newer.".to_string());
        }

        log::info!("Firecracker backend available");
        Ok(())
    }

    fn machine_config(
        &self,
        workspace_image: &Path,
        limits: &ResourceLimits,
    ) -> serde_json::Value {
        let memory = limits
            .memory_mib()
            .unwrap_or(512)
            .max(MIN_GUEST_MEMORY_MIB);
        serde_json::json!({
            "boot-source": {
                "kernel_image_path": self.config.kernel_image,
                "boot_args": self.config.boot_args.as_deref().unwrap_or(DEFAULT_BOOT_ARGS),
            },
            "drives": [
                {
                    "drive_id": "rootfs",
                    "path_on_host": self.config.rootfs_image,
                    "is_root_device": true,
                    "is_read_only": true,
                },
                {
                    "drive_id": "workspace",
                    "path_on_host": workspace_image,
                    "is_root_device": false,
                    "is_read_only": false,
                },
            ],
            "machine-config": {
                "vcpu_count": self.config.vcpu_count,
                "mem_size_mib": memory,
            },
        })
    }
}

#[async_trait]
impl SandboxBackend for VmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::IsolatedVm
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        self.check_available().await
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        self.check_available().await?;
        let limits = request.limits;

        let assess_dir = request.workspace.join(".assess");
        tokio::fs::create_dir_all(&assess_dir).await?;
        tokio::fs::write(
            assess_dir.join("plan.sh"),
            guest_script(request.plan, limits),
        )
        .await?;
        tokio::fs::write(assess_dir.join("stdin"), request.input).await?;

        // Removed with everything in it when dropped
        let vm_dir = tempfile::Builder::new().prefix("vm-").tempdir()?;
        let workspace_image = vm_dir.path().join("workspace.ext4");
        build_workspace_image(request.workspace, &workspace_image).await?;

        let config_path = vm_dir.path().join("config.json");
        let machine = serde_json::to_vec_pretty(&self.machine_config(&workspace_image, limits))
            .map_err(std::io::Error::from)?;
        tokio::fs::write(&config_path, machine).await?;

        let mut child = Command::new(&self.config.firecracker_bin)
            .arg("--no-api")
            .arg("--config-file")
            .arg(&config_path)
            .current_dir(vm_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let start_time = Instant::now();

        // Base64 inflates by a third, and there are two streams per stage
        let console_cap = limits.max_output_bytes * 4 + 64 * 1024;
        let console_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, console_cap)));

        let budget = vm_budget(request.plan, limits);
        let timed_out = match timeout(budget, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    log::debug!("Firecracker exited with {status}");
                }
                false
            }
            Err(_) => {
                log::debug!("VM exceeded {} ms, killing", budget.as_millis());
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill Firecracker process: {e}");
                }
                true
            }
        };
        let elapsed = start_time.elapsed();

        let console = match console_task {
            Some(task) => match timeout(Duration::from_secs(1), task).await {
                Ok(Ok(Ok(buffer))) => buffer.into_string(),
                _ => String::new(),
            },
            None => String::new(),
        };

        let report = parse_console(&console);
        let result = report.into_result(request.plan, limits, elapsed, timed_out)?;
        Ok(result.redact(request.workspace))
    }
}

async fn build_workspace_image(workspace: &Path, image: &Path) -> Result<(), SandboxError> {
    let output = Command::new("mke2fs")
        .args(["-q", "-F", "-t", "ext4", "-d"])
        .arg(workspace)
        .arg(image)
        .arg(WORKSPACE_IMAGE_SIZE)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(SandboxError::Protocol(format!(
            "mke2fs failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Whole seconds handed to the guest `timeout`, never below one
fn guest_seconds(wall_clock: Duration) -> u64 {
    (wall_clock.as_millis().div_ceil(1000) as u64).max(1)
}

/// Host-side deadline for one VM: boot plus the stage timeouts the plan uses,
/// each rounded up the same way the guest rounds them.
fn vm_budget(plan: &BuildPlan, limits: &ResourceLimits) -> Duration {
    let compile = if plan.is_compiled() {
        guest_seconds(limits.compile_wall_clock)
    } else {
        0
    };
    BOOT_GRACE + Duration::from_secs(compile + guest_seconds(limits.wall_clock))
}

/// Shell script run by the guest init inside `/workspace`.
///
/// Each stage runs under `timeout -s KILL`, and its frames are emitted however
/// it ended. A stage killed at its deadline is marked with `@@assess:timeout`.
fn guest_script(plan: &BuildPlan, limits: &ResourceLimits) -> String {
    let max_output = limits.max_output_bytes;
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("cd {WORKSPACE_ALIAS} || exit 1\n"));
    script.push_str(&format!(
        "emit() {{\n  echo \"@@assess:$1\"\n  head -c {max_output} \"$2\" | base64\n  echo \"@@assess:end\"\n}}\n"
    ));

    if let Some(compile) = &plan.compile {
        script.push_str("echo '@@assess:stage compile'\n");
        push_stage(
            &mut script,
            &compile.to_shell(),
            "/dev/null",
            guest_seconds(limits.compile_wall_clock),
        );
        script.push_str("[ \"$code\" -eq 0 ] || exit 0\n");
        if let Some(artifact) = &compile.artifact {
            script.push_str(&format!("[ -e {} ] || exit 0\n", shell_quote(artifact)));
        }
    }

    script.push_str("echo '@@assess:stage run'\n");
    push_stage(
        &mut script,
        &plan.run.to_shell(),
        ".assess/stdin",
        guest_seconds(limits.wall_clock),
    );
    script
}

fn push_stage(script: &mut String, command: &str, stdin: &str, secs: u64) {
    script.push_str("start=$(date +%s)\n");
    script.push_str(&format!(
        "timeout -s KILL {secs} {command} <{stdin} >.assess/out 2>.assess/err\ncode=$?\n"
    ));
    script.push_str("emit stdout .assess/out\nemit stderr .assess/err\n");
    // 137 alone could also be the OOM killer, the elapsed time tells them apart
    script.push_str(&format!(
        "[ \"$code\" -eq 137 ] && [ $(( $(date +%s) - start )) -ge {secs} ] && echo '@@assess:timeout'\n"
    ));
    script.push_str("echo \"@@assess:exit $code\"\n");
}

#[derive(Debug, Default, PartialEq)]
struct StageReport {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

#[derive(Debug, Default, PartialEq)]
struct GuestReport {
    compile: Option<StageReport>,
    run: Option<StageReport>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

fn parse_console(console: &str) -> GuestReport {
    let mut report = GuestReport::default();
    let mut in_run = false;
    let mut block: Option<(Stream, String)> = None;

    for line in console.lines() {
        let line = line.trim_end_matches('\r');
        let Some(marker) = line.strip_prefix("@@assess:") else {
            if let Some((_, text)) = block.as_mut() {
                text.push_str(line.trim());
            }
            continue;
        };

        match marker.trim() {
            "stage compile" => {
                in_run = false;
                report.compile.get_or_insert_with(StageReport::default);
                continue;
            }
            "stage run" => {
                in_run = true;
                report.run.get_or_insert_with(StageReport::default);
                continue;
            }
            "stdout" => {
                block = Some((Stream::Stdout, String::new()));
                continue;
            }
            "stderr" => {
                block = Some((Stream::Stderr, String::new()));
                continue;
            }
            _ => {}
        }

        let stage = if in_run {
            report.run.get_or_insert_with(StageReport::default)
        } else {
            report.compile.get_or_insert_with(StageReport::default)
        };

        if marker.trim() == "end" {
            if let Some((stream, text)) = block.take() {
                let decoded = match general_purpose::STANDARD.decode(text.as_bytes()) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        log::warn!("Malformed output frame from guest: {e}");
                        String::new()
                    }
                };
                match stream {
                    Stream::Stdout => stage.stdout = decoded,
                    Stream::Stderr => stage.stderr = decoded,
                }
            }
        } else if marker.trim() == "timeout" {
            stage.timed_out = true;
        } else if let Some(code) = marker.trim().strip_prefix("exit ") {
            stage.exit_code = code.trim().parse().ok();
        }
    }

    // A compile stage only exists if the guest announced one
    if report.compile == Some(StageReport::default()) {
        report.compile = None;
    }
    report
}

impl GuestReport {
    fn into_result(
        self,
        plan: &BuildPlan,
        limits: &ResourceLimits,
        elapsed: Duration,
        timed_out: bool,
    ) -> Result<ExecutionResult, SandboxError> {
        let compile_ok = self.compile.as_ref().is_none_or(|c| c.exit_code == Some(0));

        if let Some(compile) = self.compile.as_ref().filter(|c| c.timed_out) {
            let mut result =
                ExecutionResult::compile_failure(compile.stderr.clone(), None, elapsed);
            result.timed_out = true;
            result.error = Some(format!(
                "Compilation timeout after {} ms",
                limits.compile_wall_clock.as_millis()
            ));
            return Ok(result);
        }

        let run_timed_out = self.run.as_ref().is_some_and(|r| r.timed_out);
        if timed_out || run_timed_out {
            let (stdout, stderr) = self
                .run
                .map(|r| (r.stdout, r.stderr))
                .unwrap_or_default();
            return Ok(ExecutionResult::timed_out(limits.wall_clock, stdout, stderr, elapsed));
        }

        if plan.is_compiled() && (!compile_ok || self.run.is_none()) {
            let compile = self.compile.unwrap_or_default();
            let log = if compile.stderr.trim().is_empty() {
                compile.stdout
            } else {
                compile.stderr
            };
            return Ok(ExecutionResult::compile_failure(log, compile.exit_code, elapsed));
        }

        match self.run {
            Some(run) => Ok(ExecutionResult::from_streams(
                run.stdout,
                run.stderr,
                run.exit_code,
                elapsed,
            )),
            None => Err(SandboxError::Protocol(
                "guest finished without reporting a result".to_string(),
            )),
        }
    }
}
