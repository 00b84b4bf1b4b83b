//! Periodic push of store snapshots to the coordinator.
//!
//! Every tick the reporter serializes the GPU memory and GPU utilization
//! stores (only when GPU monitoring is active) and the CPU store, and hands
//! each payload to the [`ReportingChannel`]. The three calls are isolated from
//! each other: a failing push is logged and counted, nothing more.

pub mod channel;

pub use channel::JsonLinesChannel;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::health_stats::HealthStats;
use crate::store::{AgentMetrics, MetricsStore};

/// Errors surfaced by a reporting channel.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The three logical calls of the reporting channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportCall {
    CpuMetrics,
    GpuMemoryUsed,
    GpuUtilization,
}

impl ReportCall {
    pub const ALL: [ReportCall; 3] = [
        ReportCall::GpuMemoryUsed,
        ReportCall::GpuUtilization,
        ReportCall::CpuMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportCall::CpuMetrics => "reportCpuMetrics",
            ReportCall::GpuMemoryUsed => "reportGpuMemoryUsed",
            ReportCall::GpuUtilization => "reportGpuUtilization",
        }
    }
}

/// Remote interface receiving serialized metric snapshots.
///
/// `identity` names the reporting agent/container; `payload` is the JSON
/// object `{key: [timestampMillis, value], ...}` of one store.
#[async_trait]
pub trait ReportingChannel: Send + Sync {
    async fn report_cpu_metrics(&self, identity: &str, payload: &str) -> Result<(), ReportError>;

    async fn report_gpu_memory_used(&self, identity: &str, payload: &str)
        -> Result<(), ReportError>;

    async fn report_gpu_utilization(&self, identity: &str, payload: &str)
        -> Result<(), ReportError>;
}

pub struct ReportingLoop {
    channel: Arc<dyn ReportingChannel>,
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthStats>,
    identity: String,
    gpu_active: bool,
    period: Duration,
}

impl ReportingLoop {
    pub fn new(
        channel: Arc<dyn ReportingChannel>,
        metrics: Arc<AgentMetrics>,
        health: Arc<HealthStats>,
        identity: impl Into<String>,
        gpu_active: bool,
        period: Duration,
    ) -> Self {
        Self {
            channel,
            metrics,
            health,
            identity: identity.into(),
            gpu_active,
            period,
        }
    }

    fn store(&self, call: ReportCall) -> &MetricsStore {
        match call {
            ReportCall::CpuMetrics => &self.metrics.cpu,
            ReportCall::GpuMemoryUsed => &self.metrics.gpu_memory_used,
            ReportCall::GpuUtilization => &self.metrics.gpu_utilization,
        }
    }

    /// Snapshots one store and pushes it; returns whether the push succeeded.
    async fn push(&self, call: ReportCall) -> bool {
        let result = match self.store(call).snapshot_json() {
            Ok(payload) => {
                let id = self.identity.as_str();
                match call {
                    ReportCall::CpuMetrics => self.channel.report_cpu_metrics(id, &payload).await,
                    ReportCall::GpuMemoryUsed => {
                        self.channel.report_gpu_memory_used(id, &payload).await
                    }
                    ReportCall::GpuUtilization => {
                        self.channel.report_gpu_utilization(id, &payload).await
                    }
                }
            }
            Err(e) => Err(ReportError::from(e)),
        };

        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                match call {
                    ReportCall::CpuMetrics => debug!("{} failed: {}", call.as_str(), e),
                    _ => info!("{} failed: {}", call.as_str(), e),
                }
                false
            }
        };
        self.health.record_report(call, ok);
        ok
    }

    /// One reporting tick: GPU memory, GPU utilization (when active), CPU.
    pub async fn report_once(&self) {
        if self.gpu_active {
            self.push(ReportCall::GpuMemoryUsed).await;
            self.push(ReportCall::GpuUtilization).await;
        }
        self.push(ReportCall::CpuMetrics).await;
    }

    /// Pushes every period until cancelled. The first push happens one
    /// period after start.
    #[instrument(name = "reporter", skip_all, fields(identity = %self.identity))]
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting reporting loop with {}ms interval (gpu metrics: {})",
            self.period.as_millis(),
            self.gpu_active
        );
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A channel that never answers must not hold up shutdown.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.report_once() => {}
            }
        }

        info!("Reporting loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricSample;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ReportCall, String, String)>>,
        fail: Option<ReportCall>,
    }

    impl Recorder {
        fn record(&self, call: ReportCall, identity: &str, payload: &str) -> Result<(), ReportError> {
            self.calls
                .lock()
                .unwrap()
                .push((call, identity.to_string(), payload.to_string()));
            if self.fail == Some(call) {
                Err(ReportError::Transport("injected".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ReportingChannel for Recorder {
        async fn report_cpu_metrics(&self, identity: &str, payload: &str) -> Result<(), ReportError> {
            self.record(ReportCall::CpuMetrics, identity, payload)
        }
        async fn report_gpu_memory_used(
            &self,
            identity: &str,
            payload: &str,
        ) -> Result<(), ReportError> {
            self.record(ReportCall::GpuMemoryUsed, identity, payload)
        }
        async fn report_gpu_utilization(
            &self,
            identity: &str,
            payload: &str,
        ) -> Result<(), ReportError> {
            self.record(ReportCall::GpuUtilization, identity, payload)
        }
    }

    fn reporter(channel: Arc<Recorder>, gpu_active: bool) -> ReportingLoop {
        ReportingLoop::new(
            channel,
            Arc::new(AgentMetrics::new()),
            Arc::new(HealthStats::new()),
            "container_01",
            gpu_active,
            Duration::from_secs(3),
        )
    }

    #[tokio::test]
    async fn test_cpu_only_without_gpus() {
        let rec = Arc::new(Recorder::default());
        let r = reporter(rec.clone(), false);
        r.metrics.cpu.put("CPUUTIL", MetricSample::int(10, 5));

        r.report_once().await;

        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ReportCall::CpuMetrics);
        assert_eq!(calls[0].1, "container_01");
        assert_eq!(calls[0].2, r#"{"CPUUTIL":[10,5]}"#);
    }

    #[tokio::test]
    async fn test_call_order_with_gpus() {
        let rec = Arc::new(Recorder::default());
        let r = reporter(rec.clone(), true);

        r.report_once().await;

        let order: Vec<ReportCall> = rec.calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(order, ReportCall::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_calls() {
        let rec = Arc::new(Recorder {
            fail: Some(ReportCall::GpuMemoryUsed),
            ..Default::default()
        });
        let r = reporter(rec.clone(), true);

        r.report_once().await;
        r.report_once().await;

        assert_eq!(rec.calls.lock().unwrap().len(), 6);
        assert_eq!(r.health.report_failures(ReportCall::GpuMemoryUsed), 2);
        assert_eq!(r.health.reports_sent(ReportCall::GpuUtilization), 2);
        assert_eq!(r.health.reports_sent(ReportCall::CpuMetrics), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_every_period() {
        let rec = Arc::new(Recorder::default());
        let r = reporter(rec.clone(), false);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(r.run(cancel.clone()));

        // Ticks at 3s, 6s and 9s.
        tokio::time::sleep(Duration::from_millis(9500)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(rec.calls.lock().unwrap().len(), 3);
    }

    struct Unresponsive;

    #[async_trait]
    impl ReportingChannel for Unresponsive {
        async fn report_cpu_metrics(&self, _: &str, _: &str) -> Result<(), ReportError> {
            std::future::pending().await
        }
        async fn report_gpu_memory_used(&self, _: &str, _: &str) -> Result<(), ReportError> {
            std::future::pending().await
        }
        async fn report_gpu_utilization(&self, _: &str, _: &str) -> Result<(), ReportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_hung_push() {
        let r = ReportingLoop::new(
            Arc::new(Unresponsive),
            Arc::new(AgentMetrics::new()),
            Arc::new(HealthStats::new()),
            "container_01",
            true,
            Duration::from_secs(3),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(r.run(cancel.clone()));

        // The first push starts at 3s and never completes.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("reporter stops while a push is pending")
            .unwrap();
    }
}
