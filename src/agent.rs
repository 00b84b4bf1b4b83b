//! Agent assembly and lifecycle.
//!
//! [`Agent`] wires the resolver, samplers, store and reporter together;
//! [`Agent::start`] spawns one task per worker and returns an
//! [`AgentHandle`] that stops them all through a shared cancellation token.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::health_stats::HealthStats;
use crate::reporter::{ReportingChannel, ReportingLoop};
use crate::resolver::{ExplicitPid, ProcessResolver, StatResolver};
use crate::sampler::backoff::RestartPolicy;
use crate::sampler::cpu::{CpuSampler, TreeFactory};
use crate::sampler::gpu::{CommandSource, GpuDeviceList, GpuSampler, TelemetrySource};
use crate::store::AgentMetrics;
use crate::Result;

pub struct Agent {
    channel: Arc<dyn ReportingChannel>,
    identity: String,
    devices: GpuDeviceList,
    resolver: Arc<dyn ProcessResolver>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    tree_factory: Option<TreeFactory>,
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthStats>,
    proc_root: std::path::PathBuf,
    sample_interval: Duration,
    report_interval: Duration,
    restart: RestartPolicy,
    jitter: bool,
}

impl Agent {
    /// Builds an agent.
    ///
    /// `gpus` is the comma-separated device list (empty disables GPU
    /// sampling); `launcher_token` is the pid of the workload's launcher
    /// process. An explicit `pid` in the config bypasses the launcher lookup.
    pub fn new(
        channel: Arc<dyn ReportingChannel>,
        config: &Config,
        identity: impl Into<String>,
        gpus: &str,
        launcher_token: &str,
    ) -> Result<Self> {
        let proc_root = config.proc_root();

        let resolver: Arc<dyn ProcessResolver> = match config.pid {
            Some(pid) => Arc::new(ExplicitPid(pid)),
            None => {
                let launcher_pid = launcher_token.trim().parse::<u32>().map_err(|e| {
                    ConfigError::Invalid(format!(
                        "launcher token '{}' is not a pid: {}",
                        launcher_token, e
                    ))
                })?;
                Arc::new(StatResolver::new(launcher_pid, proc_root.clone()))
            }
        };

        // The telemetry command is only needed when there are GPUs to watch.
        let devices = GpuDeviceList::parse(gpus);
        let telemetry: Option<Arc<dyn TelemetrySource>> = if devices.is_empty() {
            None
        } else {
            let source = CommandSource::from_argv(&config.gpu_argv()).ok_or_else(|| {
                ConfigError::Invalid(
                    "gpu_command must not be empty when gpus are configured".into(),
                )
            })?;
            Some(Arc::new(source))
        };

        Ok(Self {
            channel,
            identity: identity.into(),
            devices,
            resolver,
            telemetry,
            tree_factory: None,
            metrics: Arc::new(AgentMetrics::new()),
            health: Arc::new(HealthStats::new()),
            proc_root,
            sample_interval: config.sample_interval(),
            report_interval: config.report_interval(),
            restart: config.restart_policy(),
            jitter: true,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_telemetry_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(source);
        self
    }

    pub fn with_tree_factory(mut self, factory: TreeFactory) -> Self {
        self.tree_factory = Some(factory);
        self
    }

    /// Fixed GPU restart delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn metrics(&self) -> Arc<AgentMetrics> {
        self.metrics.clone()
    }

    pub fn health(&self) -> Arc<HealthStats> {
        self.health.clone()
    }

    pub fn gpu_enabled(&self) -> bool {
        !self.devices.is_empty()
    }

    /// Spawns the samplers and the reporting loop on the current runtime.
    pub fn start(self) -> AgentHandle {
        let cancel = CancellationToken::new();
        let gpu_enabled = self.gpu_enabled();
        let telemetry = self.telemetry.filter(|_| gpu_enabled);

        info!(
            "Starting agent '{}' (gpus: [{}], resolver: {})",
            self.identity,
            self.devices.iter().collect::<Vec<_>>().join(","),
            self.resolver.describe()
        );

        let mut cpu = CpuSampler::new(
            self.resolver.clone(),
            self.proc_root.clone(),
            self.metrics.clone(),
            self.health.clone(),
            self.sample_interval,
        );
        if let Some(factory) = self.tree_factory {
            cpu = cpu.with_tree_factory(factory);
        }
        let cpu_task = tokio::spawn(cpu.run(cancel.child_token()));

        let gpu_task = if let Some(source) = telemetry {
            let mut gpu = GpuSampler::new(
                self.devices.clone(),
                source,
                self.metrics.clone(),
                self.health.clone(),
                self.restart.clone(),
            );
            if !self.jitter {
                gpu = gpu.without_jitter();
            }
            Some(tokio::spawn(gpu.run(cancel.child_token())))
        } else {
            debug!("No GPU devices configured; GPU sampler not started");
            None
        };

        let reporter = ReportingLoop::new(
            self.channel.clone(),
            self.metrics.clone(),
            self.health.clone(),
            self.identity.clone(),
            gpu_enabled,
            self.report_interval,
        );
        let reporter_task = tokio::spawn(reporter.run(cancel.child_token()));

        AgentHandle {
            cancel,
            cpu_task,
            gpu_task,
            reporter_task,
            metrics: self.metrics,
            health: self.health,
        }
    }
}

/// Running agent.
pub struct AgentHandle {
    cancel: CancellationToken,
    cpu_task: JoinHandle<()>,
    gpu_task: Option<JoinHandle<()>>,
    reporter_task: JoinHandle<()>,
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthStats>,
}

impl AgentHandle {
    pub fn metrics(&self) -> Arc<AgentMetrics> {
        self.metrics.clone()
    }

    pub fn health(&self) -> Arc<HealthStats> {
        self.health.clone()
    }

    pub fn gpu_sampler_running(&self) -> bool {
        self.gpu_task.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Token cancelled by [`AgentHandle::shutdown`]; also usable to stop the
    /// agent from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every worker and waits up to `timeout` for each to finish,
    /// aborting any that do not.
    pub async fn shutdown(self, timeout: Duration) {
        info!("Stopping agent");
        self.cancel.cancel();

        let mut tasks = vec![("reporter", self.reporter_task), ("cpu sampler", self.cpu_task)];
        if let Some(gpu) = self.gpu_task {
            tasks.push(("gpu sampler", gpu));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("{} stopped", name),
                Ok(Err(e)) => warn!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} did not stop within {:?}; aborting", name, timeout);
                    task.abort();
                }
            }
        }
        info!("Agent stopped");
    }
}
