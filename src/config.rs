//! Agent configuration.
//!
//! Every field is optional so that a partial YAML/JSON/TOML file can be
//! layered over the defaults; accessors apply the built-in default for
//! anything left unset. CLI overrides are applied by the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::sampler::backoff::RestartPolicy;
use crate::sampler::gpu::NVIDIA_SMI_ARGV;

pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_GPU_RESTART_INITIAL_MS: u64 = 1000;
pub const DEFAULT_GPU_RESTART_MAX_MS: u64 = 60_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_OUTPUT: &str = "-";

/// Locations searched when no config file is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 6] = [
    "/etc/resmon/agent.yaml",
    "/etc/resmon/agent.yml",
    "/etc/resmon/agent.json",
    "./resmon-agent.yaml",
    "./resmon-agent.yml",
    "./resmon-agent.json",
];

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Target
    /// Identity passed with every report (container / task id).
    pub identity: Option<String>,
    /// Comma-separated GPU device list; empty disables GPU sampling.
    pub gpus: Option<String>,
    /// Pid of the workload's launcher process.
    #[serde(alias = "launcher-pid")]
    pub launcher_pid: Option<u32>,
    /// Monitor this pid directly instead of resolving it from the launcher.
    pub pid: Option<u32>,
    #[serde(alias = "proc-root")]
    pub proc_root: Option<PathBuf>,

    // Cadence
    #[serde(alias = "sample-interval-ms")]
    pub sample_interval_ms: Option<u64>,
    #[serde(alias = "report-interval-ms")]
    pub report_interval_ms: Option<u64>,

    // GPU telemetry
    /// Telemetry command argv; defaults to nvidia-smi in CSV loop mode.
    #[serde(alias = "gpu-command")]
    pub gpu_command: Option<Vec<String>>,
    #[serde(alias = "gpu-restart")]
    pub gpu_restart: Option<bool>,
    #[serde(alias = "gpu-restart-initial-ms")]
    pub gpu_restart_initial_ms: Option<u64>,
    #[serde(alias = "gpu-restart-max-ms")]
    pub gpu_restart_max_ms: Option<u64>,
    #[serde(alias = "gpu-max-restarts")]
    pub gpu_max_restarts: Option<u32>,

    // Reporting
    /// "-" for stdout, otherwise a file path (JSON lines, appended).
    pub output: Option<String>,

    // Status server
    #[serde(alias = "status-port")]
    pub status_port: Option<u16>,
    #[serde(alias = "status-bind")]
    pub status_bind: Option<String>,

    // Lifecycle
    #[serde(alias = "exit-with-workload")]
    pub exit_with_workload: Option<bool>,
    #[serde(alias = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: Option<u64>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            gpus: Some(String::new()),
            launcher_pid: None,
            pid: None,
            proc_root: Some(PathBuf::from(DEFAULT_PROC_ROOT)),
            sample_interval_ms: Some(DEFAULT_SAMPLE_INTERVAL_MS),
            report_interval_ms: Some(DEFAULT_REPORT_INTERVAL_MS),
            gpu_command: Some(NVIDIA_SMI_ARGV.iter().map(|s| s.to_string()).collect()),
            gpu_restart: Some(true),
            gpu_restart_initial_ms: Some(DEFAULT_GPU_RESTART_INITIAL_MS),
            gpu_restart_max_ms: Some(DEFAULT_GPU_RESTART_MAX_MS),
            gpu_max_restarts: None,
            output: Some(DEFAULT_OUTPUT.to_string()),
            status_port: None,
            status_bind: Some(DEFAULT_BIND_ADDR.to_string()),
            exit_with_workload: Some(true),
            shutdown_timeout_ms: Some(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    pub fn proc_root(&self) -> PathBuf {
        self.proc_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROC_ROOT))
    }

    pub fn gpus(&self) -> &str {
        self.gpus.as_deref().unwrap_or("")
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.unwrap_or(DEFAULT_REPORT_INTERVAL_MS))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS))
    }

    pub fn gpu_argv(&self) -> Vec<String> {
        self.gpu_command
            .clone()
            .unwrap_or_else(|| NVIDIA_SMI_ARGV.iter().map(|s| s.to_string()).collect())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.gpu_restart.unwrap_or(true),
            initial_backoff: Duration::from_millis(
                self.gpu_restart_initial_ms
                    .unwrap_or(DEFAULT_GPU_RESTART_INITIAL_MS),
            ),
            max_backoff: Duration::from_millis(
                self.gpu_restart_max_ms.unwrap_or(DEFAULT_GPU_RESTART_MAX_MS),
            ),
            max_restarts: self.gpu_max_restarts,
        }
    }

    pub fn output(&self) -> &str {
        self.output.as_deref().unwrap_or(DEFAULT_OUTPUT)
    }
}

/// Validates the effective config (used by --check-config and at startup).
///
/// `require_target` additionally demands a launcher pid or explicit pid, as
/// needed to run the agent itself.
pub fn validate_effective_config(cfg: &Config, require_target: bool) -> Result<(), ConfigError> {
    if cfg.sample_interval_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "sample_interval_ms must be greater than 0".into(),
        ));
    }
    if cfg.report_interval_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "report_interval_ms must be greater than 0".into(),
        ));
    }

    let policy = cfg.restart_policy();
    if policy.initial_backoff.is_zero() {
        return Err(ConfigError::Invalid(
            "gpu_restart_initial_ms must be greater than 0".into(),
        ));
    }
    if policy.initial_backoff > policy.max_backoff {
        return Err(ConfigError::Invalid(format!(
            "gpu_restart_initial_ms ({}) exceeds gpu_restart_max_ms ({})",
            policy.initial_backoff.as_millis(),
            policy.max_backoff.as_millis()
        )));
    }

    if !cfg.gpus().is_empty() {
        if cfg.gpu_argv().is_empty() {
            return Err(ConfigError::Invalid(
                "gpu_command must not be empty when gpus are configured".into(),
            ));
        }
        for device in cfg.gpus().split(',').filter(|s| !s.is_empty()) {
            if device.trim().parse::<u32>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "gpu device '{}' is not a numeric index",
                    device
                )));
            }
        }
    }

    if let Some(bind) = cfg.status_bind.as_deref() {
        if bind.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "status_bind '{}' is not an IP address",
                bind
            )));
        }
    }

    if require_target {
        if cfg.launcher_pid.is_none() && cfg.pid.is_none() {
            return Err(ConfigError::Missing("launcher_pid (or pid)".into()));
        }
        if cfg.identity.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("identity".into()));
        }
    }

    Ok(())
}

/// Loads a config file in YAML, JSON or TOML (by extension, YAML default).
///
/// Without a path the default locations are searched; when none exists the
/// built-in defaults are returned.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.clone(),
        reason,
    };

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
    };
    info!("Loaded configuration from: {}", path.display());

    Ok(merge_with_defaults(config))
}

/// Fills every unset field of `config` from [`Config::default`].
pub fn merge_with_defaults(config: Config) -> Config {
    let d = Config::default();
    Config {
        identity: config.identity.or(d.identity),
        gpus: config.gpus.or(d.gpus),
        launcher_pid: config.launcher_pid.or(d.launcher_pid),
        pid: config.pid.or(d.pid),
        proc_root: config.proc_root.or(d.proc_root),
        sample_interval_ms: config.sample_interval_ms.or(d.sample_interval_ms),
        report_interval_ms: config.report_interval_ms.or(d.report_interval_ms),
        gpu_command: config.gpu_command.or(d.gpu_command),
        gpu_restart: config.gpu_restart.or(d.gpu_restart),
        gpu_restart_initial_ms: config.gpu_restart_initial_ms.or(d.gpu_restart_initial_ms),
        gpu_restart_max_ms: config.gpu_restart_max_ms.or(d.gpu_restart_max_ms),
        gpu_max_restarts: config.gpu_max_restarts.or(d.gpu_max_restarts),
        output: config.output.or(d.output),
        status_port: config.status_port.or(d.status_port),
        status_bind: config.status_bind.or(d.status_bind),
        exit_with_workload: config.exit_with_workload.or(d.exit_with_workload),
        shutdown_timeout_ms: config.shutdown_timeout_ms.or(d.shutdown_timeout_ms),
        log_level: config.log_level.or(d.log_level),
    }
}
