//! Drives a full agent through start, a few reporting periods and shutdown
//! with an in-memory process tree, canned GPU output and recording channels.

use async_trait::async_trait;
use resmon_agent::proctree::SampleError;
use resmon_agent::reporter::ReportCall;
use resmon_agent::sampler::cpu::TreeFactory;
use resmon_agent::sampler::gpu::TelemetryStream;
use resmon_agent::{
    Agent, AgentError, Config, ProcessTreeSource, ReportError, ReportingChannel, TelemetrySource,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TWO_GB: i64 = 2 * 1024 * 1024 * 1024;

#[derive(Default)]
struct RecordingChannel {
    calls: Mutex<Vec<(ReportCall, String, String)>>,
    fail: Option<ReportCall>,
}

impl RecordingChannel {
    fn failing(call: ReportCall) -> Self {
        Self {
            fail: Some(call),
            ..Self::default()
        }
    }

    fn record(&self, call: ReportCall, identity: &str, payload: &str) -> Result<(), ReportError> {
        self.calls
            .lock()
            .unwrap()
            .push((call, identity.to_string(), payload.to_string()));
        if self.fail == Some(call) {
            Err(ReportError::Transport("coordinator unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn calls(&self) -> Vec<(ReportCall, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: ReportCall) -> usize {
        self.calls().iter().filter(|(c, _, _)| *c == call).count()
    }

    fn last_payload(&self, call: ReportCall) -> Value {
        let calls = self.calls();
        let (_, _, payload) = calls
            .iter()
            .rev()
            .find(|(c, _, _)| *c == call)
            .expect("call was made");
        serde_json::from_str(payload).unwrap()
    }
}

#[async_trait]
impl ReportingChannel for RecordingChannel {
    async fn report_cpu_metrics(&self, identity: &str, payload: &str) -> Result<(), ReportError> {
        self.record(ReportCall::CpuMetrics, identity, payload)
    }

    async fn report_gpu_memory_used(&self, identity: &str, payload: &str) -> Result<(), ReportError> {
        self.record(ReportCall::GpuMemoryUsed, identity, payload)
    }

    async fn report_gpu_utilization(&self, identity: &str, payload: &str) -> Result<(), ReportError> {
        self.record(ReportCall::GpuUtilization, identity, payload)
    }
}

struct FixedTree {
    pid: u32,
}

impl ProcessTreeSource for FixedTree {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn update_process_tree(&mut self) -> Result<(), SampleError> {
        Ok(())
    }

    fn rss_memory_size(&self) -> i64 {
        TWO_GB
    }

    fn cpu_usage_percent(&self) -> f32 {
        37.4
    }
}

fn fixed_tree() -> TreeFactory {
    Box::new(|pid| Box::new(FixedTree { pid }) as Box<dyn ProcessTreeSource>)
}

struct CannedGpu(&'static str);

#[async_trait]
impl TelemetrySource for CannedGpu {
    async fn open(&self) -> Result<TelemetryStream, AgentError> {
        Ok(TelemetryStream::from_reader(std::io::Cursor::new(
            self.0.as_bytes().to_vec(),
        )))
    }

    fn describe(&self) -> String {
        "canned gpu output".into()
    }
}

fn config() -> Config {
    Config {
        identity: Some("container_01".into()),
        pid: Some(4242),
        gpu_restart: Some(false),
        sample_interval_ms: Some(1000),
        report_interval_ms: Some(3000),
        ..Config::default()
    }
}

fn agent(channel: Arc<RecordingChannel>, gpus: &str) -> Agent {
    Agent::new(channel, &config(), "container_01", gpus, "")
        .unwrap()
        .with_tree_factory(fixed_tree())
        .with_telemetry_source(Arc::new(CannedGpu("0, 512, 10\n1, 1024, 55\n")))
        .without_jitter()
}

#[tokio::test(start_paused = true)]
async fn test_reports_cpu_and_gpu_payloads() {
    let channel = Arc::new(RecordingChannel::default());
    let handle = agent(channel.clone(), "0,1").start();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    handle.shutdown(Duration::from_secs(1)).await;

    let calls = channel.calls();
    let order: Vec<ReportCall> = calls.iter().take(3).map(|(c, _, _)| *c).collect();
    assert_eq!(
        order,
        vec![
            ReportCall::GpuMemoryUsed,
            ReportCall::GpuUtilization,
            ReportCall::CpuMetrics
        ]
    );
    assert!(calls.iter().all(|(_, id, _)| id == "container_01"));

    let cpu = channel.last_payload(ReportCall::CpuMetrics);
    assert_eq!(cpu["CPUMEM"][1].as_f64(), Some(2.0));
    assert_eq!(cpu["CPUUTIL"][1].as_i64(), Some(37));

    let mem = channel.last_payload(ReportCall::GpuMemoryUsed);
    assert_eq!(mem["0"][1].as_i64(), Some(512));
    assert_eq!(mem["1"][1].as_i64(), Some(1024));

    let util = channel.last_payload(ReportCall::GpuUtilization);
    assert_eq!(util["0"][1].as_i64(), Some(10));
    assert_eq!(util["1"][1].as_i64(), Some(55));
}

#[tokio::test(start_paused = true)]
async fn test_empty_gpu_list_only_reports_cpu() {
    let channel = Arc::new(RecordingChannel::default());
    let handle = agent(channel.clone(), "").start();
    assert!(!handle.gpu_sampler_running());

    tokio::time::sleep(Duration::from_millis(6500)).await;
    handle.shutdown(Duration::from_secs(1)).await;

    assert_eq!(channel.count(ReportCall::CpuMetrics), 2);
    assert_eq!(channel.count(ReportCall::GpuMemoryUsed), 0);
    assert_eq!(channel.count(ReportCall::GpuUtilization), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_call_does_not_block_the_others() {
    let channel = Arc::new(RecordingChannel::failing(ReportCall::GpuMemoryUsed));
    let handle = agent(channel.clone(), "0,1").start();
    let health = handle.health();

    tokio::time::sleep(Duration::from_millis(9500)).await;
    handle.shutdown(Duration::from_secs(1)).await;

    assert_eq!(channel.count(ReportCall::GpuMemoryUsed), 3);
    assert_eq!(channel.count(ReportCall::GpuUtilization), 3);
    assert_eq!(channel.count(ReportCall::CpuMetrics), 3);
    assert_eq!(health.report_failures(ReportCall::GpuMemoryUsed), 3);
    assert_eq!(health.reports_sent(ReportCall::CpuMetrics), 3);
}

#[tokio::test(start_paused = true)]
async fn test_nothing_reported_before_first_period() {
    let channel = Arc::new(RecordingChannel::default());
    let handle = agent(channel.clone(), "0").start();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(channel.calls().is_empty());
    assert!(handle.metrics().cpu.get("CPUUTIL").is_some());

    handle.shutdown(Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(channel.calls().is_empty());
}

#[tokio::test]
async fn test_unparsable_launcher_token_is_rejected() {
    let cfg = Config {
        pid: None,
        ..config()
    };
    let result = Agent::new(
        Arc::new(RecordingChannel::default()),
        &cfg,
        "container_01",
        "",
        "not-a-pid",
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_empty_gpu_command_is_accepted_without_gpus() {
    let cfg = Config {
        gpu_command: Some(vec![]),
        ..config()
    };
    assert!(resmon_agent::config::validate_effective_config(&cfg, true).is_ok());

    let channel = Arc::new(RecordingChannel::default());
    let agent = Agent::new(channel, &cfg, "container_01", "", "").unwrap();
    assert!(!agent.gpu_enabled());

    let handle = agent.with_tree_factory(fixed_tree()).start();
    assert!(!handle.gpu_sampler_running());
    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_empty_gpu_command_is_rejected_with_gpus() {
    let cfg = Config {
        gpu_command: Some(vec![]),
        ..config()
    };
    assert!(resmon_agent::config::validate_effective_config(&cfg, true).is_ok());
    let result = Agent::new(
        Arc::new(RecordingChannel::default()),
        &cfg,
        "container_01",
        "0",
        "",
    );
    assert!(result.is_err());
}
