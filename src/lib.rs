//! resmon-agent library.
//!
//! A per-worker telemetry agent: resolves the monitored workload's process,
//! samples CPU and memory of its process tree, consumes a GPU telemetry
//! stream, keeps the latest value per metric in a [`MetricsStore`] and
//! periodically pushes snapshots through a [`ReportingChannel`].

pub mod agent;
pub mod config;
pub mod health_stats;
pub mod proctree;
pub mod reporter;
pub mod resolver;
pub mod sampler;
pub mod store;

pub use agent::{Agent, AgentHandle};
pub use config::{Config, ConfigError};
pub use health_stats::HealthStats;
pub use proctree::{ProcessTreeSource, ProcfsProcessTree};
pub use reporter::{JsonLinesChannel, ReportError, ReportingChannel, ReportingLoop};
pub use resolver::{ExplicitPid, ProcessResolver, ResolveError, StatResolver};
pub use sampler::cpu::CpuSampler;
pub use sampler::gpu::{CommandSource, GpuDeviceList, GpuSampler, TelemetrySource};
pub use store::{AgentMetrics, MetricSample, MetricValue, MetricsStore};

/// Agent result type
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Sampling error: {0}")]
    Sample(#[from] proctree::SampleError),

    #[error("Reporting error: {0}")]
    Report(#[from] ReportError),

    #[error("Telemetry stream error: {0}")]
    Telemetry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
