//! Process-tree CPU and memory sampler.
//!
//! Resolves the monitored pid lazily (resolution failures skip the tick and
//! are retried on the next one), then refreshes the process tree every
//! interval and stores `CPUMEM` (GB, two decimals, half-up) and `CPUUTIL`
//! (truncated integer percent). Both values are floored at zero.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::health_stats::HealthStats;
use crate::proctree::{ProcessTreeSource, ProcfsProcessTree};
use crate::resolver::ProcessResolver;
use crate::store::{now_millis, AgentMetrics, MetricSample, CPU_MEMORY_KEY, CPU_UTILIZATION_KEY};
use crate::AgentError;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Builds the process-tree calculator for a resolved pid.
pub type TreeFactory = Box<dyn Fn(u32) -> Box<dyn ProcessTreeSource> + Send + Sync>;

/// Rounds to two decimals, half-up on the decimal representation.
///
/// Works on the shortest decimal rendering of the value so that inputs like
/// `1.005`, stored in binary just below the midpoint, still round up.
/// Negative and non-finite inputs yield `0.0`.
pub fn round_half_up_2(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }

    let repr = value.to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    let whole: u64 = match int_part.parse() {
        Ok(v) => v,
        Err(_) => return (value * 100.0).round() / 100.0,
    };

    let mut digits = frac_part.bytes().map(|b| u64::from(b.saturating_sub(b'0')));
    let tenths = digits.next().unwrap_or(0);
    let hundredths = digits.next().unwrap_or(0);
    let thousandths = digits.next().unwrap_or(0);

    let mut cents = whole * 100 + tenths * 10 + hundredths;
    if thousandths >= 5 {
        cents += 1;
    }
    cents as f64 / 100.0
}

/// Turns raw process-tree readings into the `CPUMEM` / `CPUUTIL` samples.
pub fn cpu_samples(
    rss_bytes: i64,
    cpu_percent: f32,
    timestamp_millis: i64,
) -> (MetricSample, MetricSample) {
    let memory_gb = round_half_up_2(rss_bytes as f64 / BYTES_PER_GB).max(0.0);
    let utilization = (cpu_percent as i64).max(0);
    (
        MetricSample::float(timestamp_millis, memory_gb),
        MetricSample::int(timestamp_millis, utilization),
    )
}

pub struct CpuSampler {
    resolver: Arc<dyn ProcessResolver>,
    tree_factory: TreeFactory,
    tree: Option<Box<dyn ProcessTreeSource>>,
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthStats>,
    period: Duration,
    consecutive_failures: u32,
}

impl CpuSampler {
    pub fn new(
        resolver: Arc<dyn ProcessResolver>,
        proc_root: std::path::PathBuf,
        metrics: Arc<AgentMetrics>,
        health: Arc<HealthStats>,
        period: Duration,
    ) -> Self {
        let tree_factory: TreeFactory = Box::new(move |pid| {
            Box::new(ProcfsProcessTree::new(pid, proc_root.clone())) as Box<dyn ProcessTreeSource>
        });
        Self {
            resolver,
            tree_factory,
            tree: None,
            metrics,
            health,
            period,
            consecutive_failures: 0,
        }
    }

    /// Replaces the /proc calculator, e.g. with a scripted one.
    pub fn with_tree_factory(mut self, factory: TreeFactory) -> Self {
        self.tree_factory = factory;
        self.tree = None;
        self
    }

    /// Pid being sampled, once resolved.
    pub fn monitored_pid(&self) -> Option<u32> {
        self.tree.as_ref().map(|t| t.pid())
    }

    fn ensure_tree(&mut self) -> Result<&mut Box<dyn ProcessTreeSource>, AgentError> {
        let tree = match self.tree.take() {
            Some(tree) => tree,
            None => {
                let pid = self.resolver.resolve().map_err(|e| {
                    self.health.record_resolve_failure();
                    e
                })?;
                info!(
                    "Monitoring process tree of pid {} ({})",
                    pid,
                    self.resolver.describe()
                );
                (self.tree_factory)(pid)
            }
        };
        Ok(self.tree.insert(tree))
    }

    /// One sampling tick: refresh the tree and store both readings.
    pub fn sample_once(&mut self) -> Result<(), AgentError> {
        let tree = self.ensure_tree()?;
        tree.update_process_tree()?;

        let rss = tree.rss_memory_size();
        let cpu = tree.cpu_usage_percent();
        let (memory, utilization) = cpu_samples(rss, cpu, now_millis());

        debug!(
            "Process tree sample: rss={} bytes cpu={:.1}% -> CPUMEM={:?} CPUUTIL={:?}",
            rss, cpu, memory.value, utilization.value
        );

        self.metrics.cpu.put(CPU_MEMORY_KEY, memory);
        self.metrics.cpu.put(CPU_UTILIZATION_KEY, utilization);
        Ok(())
    }

    /// Samples every period until cancelled.
    #[instrument(name = "cpu_sampler", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Starting process-tree sampler with {}ms interval",
            self.period.as_millis()
        );
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let start = Instant::now();
            match self.sample_once() {
                Ok(()) => {
                    if self.consecutive_failures > 0 {
                        info!(
                            "Process-tree sampling recovered after {} failed ticks",
                            self.consecutive_failures
                        );
                    }
                    self.consecutive_failures = 0;
                    self.health
                        .record_sample(start.elapsed().as_secs_f64(), true);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.health.record_sample(0.0, false);
                    if self.consecutive_failures == 1 {
                        warn!("Process-tree sample failed: {}", e);
                    } else {
                        debug!(
                            "Process-tree sample failed ({} in a row): {}",
                            self.consecutive_failures, e
                        );
                    }
                }
            }
        }

        info!("Process-tree sampler stopped");
    }
}
