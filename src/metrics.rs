//! Prometheus metrics definitions for the status server.
//!
//! The gauges mirror the latest samples in the agent's stores plus the
//! agent's own health counters. They are refreshed on every `/metrics`
//! scrape from the stores, so they never hold data the stores do not.

use prometheus::{Gauge, GaugeVec, Opts, Registry};
use resmon_agent::reporter::ReportCall;
use resmon_agent::store::{CPU_MEMORY_KEY, CPU_UTILIZATION_KEY};
use resmon_agent::{AgentMetrics, HealthStats};

#[derive(Clone)]
pub struct AgentGauges {
    pub cpu_memory_gb: Gauge,
    pub cpu_utilization: Gauge,
    pub gpu_memory_used: GaugeVec,
    pub gpu_utilization: GaugeVec,
    pub sample_age_seconds: GaugeVec,

    // Agent self-metrics
    pub sample_ticks: Gauge,
    pub sample_failures: Gauge,
    pub reports_sent: GaugeVec,
    pub report_failures: GaugeVec,
    pub gpu_stream_restarts: Gauge,
}

impl AgentGauges {
    /// Creates and registers all gauges with the registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let cpu_memory_gb = Gauge::new(
            "resmon_cpu_memory_gigabytes",
            "Resident memory of the monitored process tree in GB (two decimals)",
        )?;
        let cpu_utilization = Gauge::new(
            "resmon_cpu_utilization_percent",
            "CPU utilization of the monitored process tree in percent of one core",
        )?;
        let gpu_memory_used = GaugeVec::new(
            Opts::new(
                "resmon_gpu_memory_used_mib",
                "GPU memory used as reported by the telemetry command",
            ),
            &["device"],
        )?;
        let gpu_utilization = GaugeVec::new(
            Opts::new(
                "resmon_gpu_utilization_percent",
                "GPU utilization as reported by the telemetry command",
            ),
            &["device"],
        )?;
        let sample_age_seconds = GaugeVec::new(
            Opts::new(
                "resmon_sample_age_seconds",
                "Age of the latest sample per metric key",
            ),
            &["store", "key"],
        )?;
        let sample_ticks = Gauge::new(
            "resmon_sample_ticks_total",
            "Process-tree sampling ticks since start",
        )?;
        let sample_failures = Gauge::new(
            "resmon_sample_failures_total",
            "Process-tree sampling ticks that failed",
        )?;
        let reports_sent = GaugeVec::new(
            Opts::new(
                "resmon_reports_sent_total",
                "Successful pushes to the reporting channel",
            ),
            &["call"],
        )?;
        let report_failures = GaugeVec::new(
            Opts::new(
                "resmon_report_failures_total",
                "Failed pushes to the reporting channel",
            ),
            &["call"],
        )?;
        let gpu_stream_restarts = Gauge::new(
            "resmon_gpu_stream_restarts_total",
            "Relaunches of the GPU telemetry command",
        )?;

        registry.register(Box::new(cpu_memory_gb.clone()))?;
        registry.register(Box::new(cpu_utilization.clone()))?;
        registry.register(Box::new(gpu_memory_used.clone()))?;
        registry.register(Box::new(gpu_utilization.clone()))?;
        registry.register(Box::new(sample_age_seconds.clone()))?;
        registry.register(Box::new(sample_ticks.clone()))?;
        registry.register(Box::new(sample_failures.clone()))?;
        registry.register(Box::new(reports_sent.clone()))?;
        registry.register(Box::new(report_failures.clone()))?;
        registry.register(Box::new(gpu_stream_restarts.clone()))?;

        Ok(Self {
            cpu_memory_gb,
            cpu_utilization,
            gpu_memory_used,
            gpu_utilization,
            sample_age_seconds,
            sample_ticks,
            sample_failures,
            reports_sent,
            report_failures,
            gpu_stream_restarts,
        })
    }

    /// Copies the current store snapshots and health counters into the gauges.
    pub fn refresh(&self, metrics: &AgentMetrics, health: &HealthStats, now_millis: i64) {
        self.gpu_memory_used.reset();
        self.gpu_utilization.reset();
        self.sample_age_seconds.reset();

        let cpu = metrics.cpu.snapshot();
        if let Some(s) = cpu.get(CPU_MEMORY_KEY) {
            self.cpu_memory_gb.set(s.value.as_f64());
        }
        if let Some(s) = cpu.get(CPU_UTILIZATION_KEY) {
            self.cpu_utilization.set(s.value.as_f64());
        }

        let gpu_mem = metrics.gpu_memory_used.snapshot();
        for (device, s) in &gpu_mem {
            self.gpu_memory_used
                .with_label_values(&[device.as_str()])
                .set(s.value.as_f64());
        }
        let gpu_util = metrics.gpu_utilization.snapshot();
        for (device, s) in &gpu_util {
            self.gpu_utilization
                .with_label_values(&[device.as_str()])
                .set(s.value.as_f64());
        }

        for (store, snap) in [("cpu", &cpu), ("gpu_memory", &gpu_mem), ("gpu_utilization", &gpu_util)] {
            for (key, s) in snap {
                let age = (now_millis - s.timestamp_millis).max(0) as f64 / 1000.0;
                self.sample_age_seconds
                    .with_label_values(&[store, key.as_str()])
                    .set(age);
            }
        }

        self.sample_ticks.set(health.sample_ticks() as f64);
        self.sample_failures.set(health.sample_failures() as f64);
        self.gpu_stream_restarts.set(health.gpu_restarts() as f64);
        for call in ReportCall::ALL {
            self.reports_sent
                .with_label_values(&[call.as_str()])
                .set(health.reports_sent(call) as f64);
            self.report_failures
                .with_label_values(&[call.as_str()])
                .set(health.report_failures(call) as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};
    use resmon_agent::MetricSample;

    #[test]
    fn test_refresh_exports_store_contents() {
        let registry = Registry::new();
        let gauges = AgentGauges::new(&registry).unwrap();
        let metrics = AgentMetrics::new();
        let health = HealthStats::new();

        metrics.cpu.put(CPU_MEMORY_KEY, MetricSample::float(1_000, 2.0));
        metrics.cpu.put(CPU_UTILIZATION_KEY, MetricSample::int(1_000, 37));
        metrics.gpu_memory_used.put("3", MetricSample::int(1_000, 1024));
        health.record_report(ReportCall::CpuMetrics, false);

        gauges.refresh(&metrics, &health, 4_000);

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("resmon_cpu_memory_gigabytes 2"));
        assert!(text.contains("resmon_cpu_utilization_percent 37"));
        assert!(text.contains("resmon_gpu_memory_used_mib{device=\"3\"} 1024"));
        assert!(text.contains("resmon_report_failures_total{call=\"reportCpuMetrics\"} 1"));
        assert!(text.contains("store=\"gpu_memory\""));
    }
}
