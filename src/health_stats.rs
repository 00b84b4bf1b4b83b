//! Running statistics about the agent's own behaviour.
//!
//! Samplers and the reporter record outcomes here; the status server renders
//! them on `/health` and exports them on `/metrics`.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::reporter::ReportCall;

#[derive(Clone, Copy, Default)]
struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

#[derive(Default)]
struct Stat {
    inner: Mutex<RunningStat>,
}

impl Stat {
    fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    /// (current, average, max, min, count)
    fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        if let Ok(s) = self.inner.lock() {
            (s.last, s.avg(), s.max, s.min, s.count)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0)
        }
    }
}

/// Per-call push counters.
#[derive(Default)]
struct CallCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
pub struct HealthStats {
    sample_duration_seconds: Stat,
    sample_ticks: AtomicU64,
    sample_failures: AtomicU64,
    resolve_failures: AtomicU64,
    gpu_lines: AtomicU64,
    gpu_malformed_lines: AtomicU64,
    gpu_restarts: AtomicU64,
    report_cpu: CallCounters,
    report_gpu_memory: CallCounters,
    report_gpu_utilization: CallCounters,
}

impl HealthStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_sample(&self, duration_seconds: f64, success: bool) {
        self.sample_ticks.fetch_add(1, Ordering::Relaxed);
        if success {
            self.sample_duration_seconds.add_sample(duration_seconds);
        } else {
            self.sample_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gpu_line(&self, malformed: bool) {
        self.gpu_lines.fetch_add(1, Ordering::Relaxed);
        if malformed {
            self.gpu_malformed_lines.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_gpu_restart(&self) {
        self.gpu_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report(&self, call: ReportCall, success: bool) {
        let counters = self.counters(call);
        if success {
            counters.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counters(&self, call: ReportCall) -> &CallCounters {
        match call {
            ReportCall::CpuMetrics => &self.report_cpu,
            ReportCall::GpuMemoryUsed => &self.report_gpu_memory,
            ReportCall::GpuUtilization => &self.report_gpu_utilization,
        }
    }

    pub fn sample_ticks(&self) -> u64 {
        self.sample_ticks.load(Ordering::Relaxed)
    }

    pub fn sample_failures(&self) -> u64 {
        self.sample_failures.load(Ordering::Relaxed)
    }

    pub fn resolve_failures(&self) -> u64 {
        self.resolve_failures.load(Ordering::Relaxed)
    }

    pub fn gpu_lines(&self) -> u64 {
        self.gpu_lines.load(Ordering::Relaxed)
    }

    pub fn gpu_malformed_lines(&self) -> u64 {
        self.gpu_malformed_lines.load(Ordering::Relaxed)
    }

    pub fn gpu_restarts(&self) -> u64 {
        self.gpu_restarts.load(Ordering::Relaxed)
    }

    pub fn reports_sent(&self, call: ReportCall) -> u64 {
        self.counters(call).sent.load(Ordering::Relaxed)
    }

    pub fn report_failures(&self, call: ReportCall) -> u64 {
        self.counters(call).failed.load(Ordering::Relaxed)
    }

    pub fn render_table(&self) -> String {
        let (sd_cur, sd_avg, sd_max, sd_min, _sd_count) = self.sample_duration_seconds.snapshot();

        let left_col = 26usize;
        let col_w = 12usize;

        let mut out = String::new();

        writeln!(
            out,
            "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
            "metric",
            "current",
            "average",
            "max",
            "min",
            left = left_col,
            col = col_w
        )
        .ok();

        writeln!(out, "{}", "-".repeat(left_col + 3 + (col_w + 3) * 4)).ok();

        writeln!(
            out,
            "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
            "sample duration (s)",
            format!("{:.4}", sd_cur),
            format!("{:.4}", sd_avg),
            format!("{:.4}", sd_max),
            format!("{:.4}", sd_min),
            left = left_col,
            col = col_w
        )
        .ok();

        writeln!(out).ok();
        writeln!(out, "sample ticks: {}", self.sample_ticks()).ok();
        writeln!(out, "sample failures: {}", self.sample_failures()).ok();
        writeln!(out, "pid resolution failures: {}", self.resolve_failures()).ok();
        writeln!(
            out,
            "gpu lines: {} ({} malformed)",
            self.gpu_lines(),
            self.gpu_malformed_lines()
        )
        .ok();
        writeln!(out, "gpu stream restarts: {}", self.gpu_restarts()).ok();
        for call in ReportCall::ALL {
            writeln!(
                out,
                "{}: {} sent, {} failed",
                call.as_str(),
                self.reports_sent(call),
                self.report_failures(call)
            )
            .ok();
        }

        out
    }
}
