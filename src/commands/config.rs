//! Configuration file generation.

use anyhow::Result;
use resmon_agent::Config;
use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;

/// Default file name when no output path is given.
const DEFAULT_CONFIG_FILE: &str = "resmon-agent.yaml";

/// Generates configuration files
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<()> {
    let config = Config::default();
    let output = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let content = render_config(&config, format, commented)?;

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Serializes `config`; comments are only added to YAML output.
pub fn render_config(config: &Config, format: ConfigFormat, commented: bool) -> Result<String> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => {
            let yaml = serde_yaml::to_string(config)?;
            if commented {
                add_config_comments(yaml)
            } else {
                yaml
            }
        }
    })
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# resmon-agent Configuration
# ==========================
#
# Target
# ------
# identity: "container_01"     # Sent with every report
# gpus: "0,1"                  # Comma-separated device indices ("" = no GPU monitoring)
# launcher_pid: 4242           # Launcher whose stat record names the workload pid
# pid: null                    # Monitor this pid directly instead
# proc_root: "/proc"           # Alternative /proc mount
#
# Timing
# ------
# sample_interval_ms: 1000     # Process-tree sampling interval
# report_interval_ms: 3000     # Push interval
#
# GPU Telemetry
# -------------
# gpu_command: [nvidia-smi, ...]  # Program and arguments, one CSV line per device
# gpu_restart: true            # Relaunch the command when it exits
# gpu_restart_initial_ms: 1000 # First restart delay
# gpu_restart_max_ms: 60000    # Restart delay cap
# gpu_max_restarts: null       # null = unlimited
#
# Reporting
# ---------
# output: "-"                  # "-" for stdout or a file path (JSON lines)
#
# Status Server
# -------------
# status_port: null            # Port for /metrics, /health, /snapshot (null = disabled)
# status_bind: "127.0.0.1"     # Bind IP
#
# Lifecycle
# ---------
# exit_with_workload: true     # Stop when the launcher process exits
# shutdown_timeout_ms: 5000    # Per-shutdown grace period for workers
#
# Logging
# -------
# log_level: "info"            # off, error, warn, info, debug, trace
"#;

    format!("{comments}\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commented_yaml_parses_back() {
        let text = render_config(&Config::default(), ConfigFormat::Yaml, true).unwrap();
        assert!(text.starts_with("# resmon-agent Configuration"));
        let parsed: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(parsed.sample_interval_ms, Some(1000));
        assert_eq!(parsed.report_interval_ms, Some(3000));
    }

    #[test]
    fn test_json_output_is_valid() {
        let text = render_config(&Config::default(), ConfigFormat::Json, true).unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.gpus.as_deref(), Some(""));
    }
}
