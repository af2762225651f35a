use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxBackendType {
    #[default]
    Docker,
    Local,
}

impl SandboxBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxBackendType::Docker => "docker",
            SandboxBackendType::Local => "local",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackendType,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    /// Docker-compatible CLI used by the docker backend.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: PathBuf,
    /// Path of the instrumentation library. Inside the image for the docker
    /// backend, on the host for the local backend.
    #[serde(default = "default_probe_library")]
    pub probe_library: PathBuf,
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    #[serde(default = "default_container_executable")]
    pub container_executable: String,
    #[serde(default = "default_container_canary")]
    pub container_canary: String,
    /// Folder the probe writes its trace records to, relative to the working directory.
    #[serde(default = "default_traces_folder")]
    pub traces_folder: String,
    /// Parent directory for per-session host folders. The system temporary
    /// directory is used when unset.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
}

fn default_image_tag() -> String {
    "qbdi_args_fuzzing".to_string()
}

fn default_container_runtime() -> PathBuf {
    PathBuf::from("docker")
}

fn default_probe_library() -> PathBuf {
    PathBuf::from("/home/docker/libqbdi_tracer.so")
}

fn default_container_workdir() -> String {
    "/home/docker".to_string()
}

fn default_container_executable() -> String {
    "/home/docker/target/target".to_string()
}

fn default_container_canary() -> String {
    "/tmp/canary.opencrs".to_string()
}

fn default_traces_folder() -> String {
    "traces".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackendType::default(),
            image_tag: default_image_tag(),
            container_runtime: default_container_runtime(),
            probe_library: default_probe_library(),
            container_workdir: default_container_workdir(),
            container_executable: default_container_executable(),
            container_canary: default_container_canary(),
            traces_folder: default_traces_folder(),
            work_root: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_canary_string")]
    pub canary_string: String,
    /// Extends the baseline with random `-`/`--` tokens, for targets whose
    /// traces are not fully deterministic.
    #[serde(default)]
    pub random_baseline_arguments: bool,
    #[serde(default = "default_random_arguments_count")]
    pub random_arguments_count: usize,
    #[serde(default)]
    pub seed: u64,
}

pub fn default_timeout_secs() -> u64 {
    5
}

fn default_canary_string() -> String {
    "string".to_string()
}

pub fn default_random_arguments_count() -> usize {
    10
}

impl FuzzerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            canary_string: default_canary_string(),
            random_baseline_arguments: false,
            random_arguments_count: default_random_arguments_count(),
            seed: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ArgprobeConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
}

impl ArgprobeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ArgprobeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// `timeout 0` disables the limit, so a zero timeout is refused.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.fuzzer.timeout_secs == 0 {
            anyhow::bail!("fuzzer.timeout-secs must be at least 1");
        }
        Ok(())
    }
}
