//! CLI arguments and subcommands for resmon-agent.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "resmon-agent",
    about = "Resource telemetry agent for a running compute task",
    long_about = "Resource telemetry agent for a running compute task.\n\n\
                  Attaches to the process tree of a workload, samples its CPU and memory usage \
                  and the memory/utilization of its assigned GPUs, and periodically pushes the \
                  latest readings to a coordinator.",
    author = "Michael Moll <proc-mem@herakles.io> - Herakles IO",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Identity sent with every report (container / task id)
    #[arg(short = 'i', long)]
    pub identity: Option<String>,

    /// Comma-separated GPU device indices (empty = no GPU monitoring)
    #[arg(short = 'g', long)]
    pub gpus: Option<String>,

    /// Pid of the workload's launcher process
    #[arg(short = 'l', long)]
    pub launcher_pid: Option<u32>,

    /// Monitor this pid directly instead of resolving it from the launcher
    #[arg(long)]
    pub pid: Option<u32>,

    /// Report destination: "-" for stdout or a file path (JSON lines)
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Process-tree sampling interval in milliseconds
    #[arg(long)]
    pub sample_interval_ms: Option<u64>,

    /// Reporting interval in milliseconds
    #[arg(long)]
    pub report_interval_ms: Option<u64>,

    /// Do not relaunch the GPU telemetry command when it dies
    #[arg(long)]
    pub no_gpu_restart: bool,

    /// Keep running after the launcher process exits
    #[arg(long)]
    pub keep_running: bool,

    /// Serve /health, /metrics and /snapshot on this port
    #[arg(short = 'p', long)]
    pub status_port: Option<u16>,

    /// Bind the status server to a specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Alternative /proc mount
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Log level (overrides the config file, default info)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate /proc access, pid resolution and the GPU telemetry command
    Check {
        /// Only check /proc and pid resolution
        #[arg(long)]
        proc: bool,

        /// Only check the GPU telemetry command
        #[arg(long)]
        gpu: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Sample a process tree and print the CPU payload each interval
    Sample {
        /// Pid whose tree is sampled (defaults to the resolved target)
        #[arg(long)]
        pid: Option<u32>,

        /// Number of samples
        #[arg(short = 'n', long, default_value_t = 3)]
        iterations: usize,
    },
}
