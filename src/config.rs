use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};

use crate::language::Language;

#[derive(Parser)]
#[command(name = "assessd", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', env = "ASSESSD_CONFIG")]
    pub config_path: String,

    /// Whether to flush the existing record store
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Seed file with assessments to create at boot
    #[arg(long = "seed")]
    pub seed_path: Option<String>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    pub vm: Option<VmConfig>,
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    BareSubprocess,
    ContainerRuntime,
    IsolatedVm,
    RemoteService,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BareSubprocess => "bare_subprocess",
            Self::ContainerRuntime => "container_runtime",
            Self::IsolatedVm => "isolated_vm",
            Self::RemoteService => "remote_service",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Defaults to twice the execution time
    pub compile_timeout_ms: Option<u64>,
    #[serde(default = "default_max_stdout_bytes")]
    pub max_stdout_bytes: usize,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: ByteSize,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    #[serde(default = "default_backend")]
    pub sandbox_backend: BackendKind,
    #[serde(default)]
    pub allow_fallback_backend: bool,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    /// Extra time granted on top of the step timeouts for image pulls or VM boot
    #[serde(default = "default_provision_grace_ms")]
    pub provision_grace_ms: u64,
    #[serde(default)]
    pub grade_hidden_on_submit: bool,
}

impl EngineConfig {
    pub fn compile_timeout_ms(&self) -> u64 {
        self.compile_timeout_ms
            .unwrap_or(self.max_execution_time_ms.saturating_mul(2))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_code_length: default_max_code_length(),
            max_execution_time_ms: default_max_execution_time_ms(),
            compile_timeout_ms: None,
            max_stdout_bytes: default_max_stdout_bytes(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            sandbox_backend: default_backend(),
            allow_fallback_backend: false,
            max_concurrent_executions: default_max_concurrent_executions(),
            provision_grace_ms: default_provision_grace_ms(),
            grade_hidden_on_submit: false,
        }
    }
}

fn default_max_code_length() -> usize {
    50_000
}

fn default_max_execution_time_ms() -> u64 {
    10_000
}

fn default_max_stdout_bytes() -> usize {
    64 * 1024
}

fn default_memory_limit() -> ByteSize {
    ByteSize(512 * 1024 * 1024)
}

fn default_cpu_limit() -> f32 {
    1.0
}

fn default_backend() -> BackendKind {
    BackendKind::ContainerRuntime
}

fn default_max_concurrent_executions() -> usize {
    4
}

fn default_provision_grace_ms() -> u64 {
    30_000
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Alternative OCI runtime registered with the daemon, e.g. `runsc`
    pub runtime: Option<String>,
    #[serde(default)]
    pub images: HashMap<Language, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct VmConfig {
    pub firecracker_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u8,
    pub boot_args: Option<String>,
}

fn default_vcpu_count() -> u8 {
    1
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default)]
    pub language_versions: HashMap<Language, String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    JsonFile,
    Sqlite,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    pub path: Option<PathBuf>,
}

/// A size in bytes, written in config either as a plain byte count or as a
/// string with a `k`/`m`/`g` suffix. A bare numeric string is read as MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (digits, multiplier) = match s.chars().last()? {
            'k' => (&s[..s.len() - 1], 1024),
            'm' => (&s[..s.len() - 1], 1024 * 1024),
            'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            _ => (s.as_str(), 1024 * 1024),
        };
        let value: u64 = digits.trim().parse().ok()?;
        value.checked_mul(multiplier).map(ByteSize)
    }

    pub fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(b) => Ok(ByteSize(b)),
            Raw::Text(t) => ByteSize::parse(&t)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid size: {t}"))),
        }
    }
}
