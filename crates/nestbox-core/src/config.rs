//! Configuration resolution for Nestbox.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/nestbox/settings.json)
//! 3. Data directory config (<data_dir>/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the daemon binary)
//!
//! Config files are partial: any field left out keeps the value from the
//! layer below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Nestbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub assistant: AssistantConfig,
    pub timing: TimingConfig,
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
    pub retry: RetryConfig,
}

/// Identity of the assistant and the privileged group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssistantConfig {
    pub name: String,
    pub main_group_folder: String,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: "Andy".to_string(),
            main_group_folder: "main".to_string(),
        }
    }
}

/// Control-loop timer periods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub ipc_poll_interval_ms: u64,
    pub scheduler_poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            ipc_poll_interval_ms: 1_000,
            scheduler_poll_interval_ms: 60_000,
            shutdown_grace_secs: 30,
        }
    }
}

impl TimingConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn ipc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ipc_poll_interval_ms)
    }

    pub const fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Sandbox engine used to run agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Direct,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Self::Docker),
            "direct" => Ok(Self::Direct),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// How credentials reach the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretDelivery {
    /// Inside the stdin input document.
    #[default]
    Inline,
    /// In a single read-only file mounted next to the workspace.
    File,
}

/// Per-execution limits and sandbox selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub terminate_grace_secs: u64,
    pub backend: BackendKind,
    pub image: String,
    pub secret_delivery: SecretDelivery,
    /// Program and arguments for the direct backend.
    pub agent_command: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout_secs: 30 * 60,
            idle_timeout_secs: 30 * 60,
            max_output_bytes: 10 * 1024 * 1024, // 10 MiB
            terminate_grace_secs: 5,
            backend: BackendKind::Docker,
            image: "nestbox-agent:latest".to_string(),
            secret_delivery: SecretDelivery::Inline,
            agent_command: vec!["nestbox-agent".to_string()],
        }
    }
}

impl ExecutionConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub groups_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub secrets_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            groups_dir: None,
            store_path: None,
            secrets_file: None,
        }
    }
}

impl PathsConfig {
    /// Root of the per-group IPC namespaces.
    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.groups_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("groups"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("store").join("nestbox.db"))
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.secrets_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(".env"))
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }
}

/// Backoff for executions that fail before delivering anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5_000,
        }
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    DataDir = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(data_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(read_layer(&global_path)?);
    }

    let data_dir = data_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("NESTBOX_DATA_DIR").ok().map(PathBuf::from));
    if let Some(dir) = &data_dir {
        let local_path = dir.join("settings.json");
        if local_path.exists() {
            layers.push(read_layer(&local_path)?);
        }
    }

    let mut merged = serde_json::to_value(Config::default())?;
    for layer in layers {
        merge_json(&mut merged, layer);
    }
    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    if let Some(dir) = data_dir {
        config.paths.data_dir = dir;
    }
    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".nestbox").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/nestbox/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("nestbox").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from(".nestbox"), |h| h.join(".nestbox"))
}

fn read_layer(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, scalars replace.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("NESTBOX_ASSISTANT_NAME") {
        config.assistant.name = val;
    }
    if let Some(n) = env_parse("NESTBOX_MAX_CONCURRENT") {
        config.execution.max_concurrent = n;
    }
    if let Some(n) = env_parse("NESTBOX_EXECUTION_TIMEOUT_SECS") {
        config.execution.timeout_secs = n;
    }
    if let Some(n) = env_parse("NESTBOX_IDLE_TIMEOUT_SECS") {
        config.execution.idle_timeout_secs = n;
    }
    if let Some(n) = env_parse("NESTBOX_MAX_OUTPUT_BYTES") {
        config.execution.max_output_bytes = n;
    }
    if let Some(kind) = env_parse("NESTBOX_BACKEND") {
        config.execution.backend = kind;
    }
    if let Ok(val) = std::env::var("NESTBOX_IMAGE") {
        config.execution.image = val;
    }
    if let Some(n) = env_parse("NESTBOX_POLL_INTERVAL_MS") {
        config.timing.poll_interval_ms = n;
    }
}

/// Reject configurations the control loop cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    if config.assistant.name.trim().is_empty() {
        return Err(Error::Config("assistant.name must not be empty".into()));
    }
    if !crate::ipc::is_valid_group_folder(&config.assistant.main_group_folder) {
        return Err(Error::Config(format!(
            "assistant.main_group_folder '{}' is not a valid folder name",
            config.assistant.main_group_folder
        )));
    }
    if config.execution.max_concurrent == 0 {
        return Err(Error::Config("execution.max_concurrent must be at least 1".into()));
    }
    if config.timing.poll_interval_ms == 0 || config.timing.ipc_poll_interval_ms == 0 {
        return Err(Error::Config("poll intervals must be non-zero".into()));
    }
    if config.execution.backend == BackendKind::Direct && config.execution.agent_command.is_empty()
    {
        return Err(Error::Config(
            "execution.agent_command is required for the direct backend".into(),
        ));
    }
    Ok(())
}
