//! GPU telemetry stream consumer.
//!
//! Runs an external command that prints one CSV line per device per polling
//! tick (`index,memory_used,utilization`) and routes each line to the device
//! in the caller's list whose numeric value matches the index. Samples are
//! keyed by the caller's device string and stored unrounded.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::{Backoff, RestartPolicy};
use crate::health_stats::HealthStats;
use crate::store::{now_millis, AgentMetrics, MetricSample};
use crate::AgentError;

/// Default telemetry command: one CSV line per GPU every second.
pub const NVIDIA_SMI_ARGV: [&str; 5] = [
    "nvidia-smi",
    "--format=csv,noheader,nounits",
    "--query-gpu=index,memory.used,utilization.gpu",
    "-l",
    "1",
];

/// Ordered device identifiers as supplied by the caller (e.g. `"0,3"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuDeviceList {
    devices: Vec<String>,
}

impl GpuDeviceList {
    /// Splits a comma-separated list; empty tokens are dropped and the
    /// remaining entries keep their original spelling.
    pub fn parse(list: &str) -> Self {
        Self {
            devices: list
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }

    /// The caller's identifier of the device whose numeric value is `index`.
    pub fn key_for_index(&self, index: u32) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.trim().parse::<u32>().ok() == Some(index))
            .map(String::as_str)
    }
}

/// One parsed telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuReading {
    pub index: u32,
    pub memory_used: i64,
    pub utilization: i64,
}

/// Parses `index,memory_used,utilization`; fields are trimmed, empty fields
/// are skipped and anything after the third field is ignored.
pub fn parse_gpu_line(line: &str) -> Result<GpuReading, String> {
    let fields: Vec<&str> = line.split(',').filter(|s| !s.is_empty()).collect();
    if fields.len() < 3 {
        return Err(format!("expected 3 fields, got {}", fields.len()));
    }

    let index = fields[0]
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid device index '{}': {}", fields[0].trim(), e))?;
    let memory_used = fields[1]
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid memory value '{}': {}", fields[1].trim(), e))?;
    let utilization = fields[2]
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid utilization value '{}': {}", fields[2].trim(), e))?;

    Ok(GpuReading {
        index,
        memory_used,
        utilization,
    })
}

/// Line stream of a running telemetry source.
pub struct TelemetryStream {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    // Held so the process is killed when the stream is dropped.
    _child: Option<Child>,
}

impl TelemetryStream {
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
            _child: None,
        }
    }

    fn from_child(mut child: Child) -> Result<Self, AgentError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Telemetry("child stdout not captured".into()))?;
        let mut stream = Self::from_reader(stdout);
        stream._child = Some(child);
        Ok(stream)
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

/// Something that can be (re)started to produce telemetry lines.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn open(&self) -> Result<TelemetryStream, AgentError>;

    fn describe(&self) -> String;
}

/// Runs an external command and reads its stdout.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Program followed by its arguments; `None` for an empty vector.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl TelemetrySource for CommandSource {
    async fn open(&self) -> Result<TelemetryStream, AgentError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Telemetry(format!("failed to spawn {}: {}", self.program, e)))?;
        TelemetryStream::from_child(child)
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a telemetry session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    /// EOF: the command exited.
    Exhausted { stored: u64 },
    Broken { stored: u64, error: String },
}

pub struct GpuSampler {
    devices: GpuDeviceList,
    source: Arc<dyn TelemetrySource>,
    metrics: Arc<AgentMetrics>,
    health: Arc<HealthStats>,
    restart: RestartPolicy,
    jitter: bool,
}

impl GpuSampler {
    pub fn new(
        devices: GpuDeviceList,
        source: Arc<dyn TelemetrySource>,
        metrics: Arc<AgentMetrics>,
        health: Arc<HealthStats>,
        restart: RestartPolicy,
    ) -> Self {
        Self {
            devices,
            source,
            metrics,
            health,
            restart,
            jitter: true,
        }
    }

    /// Fixed restart delays, for deterministic scheduling.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Routes one telemetry line into the stores.
    ///
    /// Returns `Ok(true)` when a device matched, `Ok(false)` when the index
    /// is not in the device list (no store mutation).
    pub fn apply_line(&self, line: &str) -> Result<bool, String> {
        let reading = parse_gpu_line(line)?;
        let key = match self.devices.key_for_index(reading.index) {
            Some(k) => k,
            None => return Ok(false),
        };

        let now = now_millis();
        self.metrics
            .gpu_memory_used
            .put(key, MetricSample::int(now, reading.memory_used));
        self.metrics
            .gpu_utilization
            .put(key, MetricSample::int(now, reading.utilization));
        Ok(true)
    }

    async fn consume(&self, stream: &mut TelemetryStream, cancel: &CancellationToken) -> SessionEnd {
        let mut stored = 0u64;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                next = stream.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match self.apply_line(&line) {
                        Ok(matched) => {
                            self.health.record_gpu_line(false);
                            if matched {
                                stored += 1;
                            }
                        }
                        Err(e) => {
                            self.health.record_gpu_line(true);
                            return SessionEnd::Broken {
                                stored,
                                error: format!("malformed line '{}': {}", line, e),
                            };
                        }
                    }
                }
                Ok(None) => return SessionEnd::Exhausted { stored },
                Err(e) => {
                    return SessionEnd::Broken {
                        stored,
                        error: e.to_string(),
                    }
                }
            }
        }
    }

    /// Consumes the telemetry source until cancelled, relaunching it after
    /// failures according to the restart policy.
    #[instrument(name = "gpu_sampler", skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting GPU sampler for devices [{}] using '{}'",
            self.devices.iter().collect::<Vec<_>>().join(","),
            self.source.describe()
        );

        let mut backoff = Backoff::from_policy(&self.restart);
        if !self.jitter {
            backoff = backoff.without_jitter();
        }
        let mut restarts = 0u32;

        loop {
            let stored = match self.source.open().await {
                Ok(mut stream) => match self.consume(&mut stream, &cancel).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Exhausted { stored } => {
                        warn!("GPU telemetry stream ended after {} readings", stored);
                        stored
                    }
                    SessionEnd::Broken { stored, error } => {
                        warn!("GPU telemetry stream failed after {} readings: {}", stored, error);
                        stored
                    }
                },
                Err(e) => {
                    warn!("Failed to start GPU telemetry source: {}", e);
                    0
                }
            };

            if cancel.is_cancelled() {
                break;
            }
            if !self.restart.allows_restart(restarts) {
                warn!(
                    "GPU sampling stopped after {} restarts; GPU metrics will stay at their last values",
                    restarts
                );
                return;
            }

            if stored > 0 {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            restarts += 1;
            self.health.record_gpu_restart();
            info!(
                "Restarting GPU telemetry in {}ms (restart #{})",
                delay.as_millis(),
                restarts
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("GPU sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricValue;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Hands out the same canned output on every open.
    struct CannedSource {
        output: &'static str,
        opens: AtomicU32,
    }

    impl CannedSource {
        fn new(output: &'static str) -> Arc<Self> {
            Arc::new(Self {
                output,
                opens: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TelemetrySource for CannedSource {
        async fn open(&self) -> Result<TelemetryStream, AgentError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(TelemetryStream::from_reader(std::io::Cursor::new(
                self.output.as_bytes().to_vec(),
            )))
        }

        fn describe(&self) -> String {
            "canned".into()
        }
    }

    fn sampler(devices: &str, source: Arc<dyn TelemetrySource>, restart: RestartPolicy) -> GpuSampler {
        GpuSampler::new(
            GpuDeviceList::parse(devices),
            source,
            Arc::new(AgentMetrics::new()),
            Arc::new(HealthStats::new()),
            restart,
        )
        .without_jitter()
    }

    #[test]
    fn test_device_list_parsing() {
        let list = GpuDeviceList::parse("0,,3");
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["0", "3"]);
        assert!(GpuDeviceList::parse("").is_empty());
    }

    #[test]
    fn test_key_for_index_matches_value_not_position() {
        let list = GpuDeviceList::parse("3,1");
        assert_eq!(list.key_for_index(1), Some("1"));
        assert_eq!(list.key_for_index(3), Some("3"));
        assert_eq!(list.key_for_index(0), None);
    }

    #[test]
    fn test_parse_gpu_line() {
        assert_eq!(
            parse_gpu_line("0, 512, 10").unwrap(),
            GpuReading {
                index: 0,
                memory_used: 512,
                utilization: 10
            }
        );
        assert!(parse_gpu_line("0, 512").is_err());
        assert!(parse_gpu_line("0, [N/A], 10").is_err());
        assert!(parse_gpu_line("GPU-0, 512, 10").is_err());
    }

    #[test]
    fn test_apply_line_end_to_end() {
        let s = sampler("0,1", CannedSource::new(""), RestartPolicy::disabled());
        assert!(s.apply_line("0,512,10").unwrap());
        assert!(s.apply_line("1,1024,55").unwrap());

        let mem = s.metrics.gpu_memory_used.snapshot();
        let util = s.metrics.gpu_utilization.snapshot();
        assert_eq!(mem.len(), 2);
        assert_eq!(mem["0"].value, MetricValue::Int(512));
        assert_eq!(mem["1"].value, MetricValue::Int(1024));
        assert_eq!(util["0"].value, MetricValue::Int(10));
        assert_eq!(util["1"].value, MetricValue::Int(55));
    }

    #[test]
    fn test_unmatched_index_is_ignored() {
        let s = sampler("0,1", CannedSource::new(""), RestartPolicy::disabled());
        assert!(!s.apply_line("5,2048,99").unwrap());
        assert!(s.metrics.gpu_memory_used.is_empty());
        assert!(s.metrics.gpu_utilization.is_empty());
    }

    #[test]
    fn test_key_keeps_caller_spelling() {
        let s = sampler("01", CannedSource::new(""), RestartPolicy::disabled());
        assert!(s.apply_line("1, 300, 4").unwrap());
        assert!(s.metrics.gpu_memory_used.get("01").is_some());
    }

    #[tokio::test]
    async fn test_malformed_line_ends_session_without_restart() {
        let source = CannedSource::new("0, 100, 1\n0, bogus, 2\n1, 200, 3\n");
        let s = sampler("0,1", source.clone(), RestartPolicy::disabled());
        let metrics = s.metrics.clone();
        let health = s.health.clone();

        s.run(CancellationToken::new()).await;

        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        let keys: Vec<String> = metrics.gpu_memory_used.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["0".to_string()]);
        assert_eq!(
            metrics.gpu_memory_used.get("0").map(|s| s.value),
            Some(MetricValue::Int(100))
        );
        assert_eq!(health.gpu_lines(), 2);
        assert_eq!(health.gpu_malformed_lines(), 1);
        assert_eq!(health.gpu_restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_triggers_restart_when_enabled() {
        let source = CannedSource::new("0, 100, 1\nnot a reading\n");
        let policy = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            max_restarts: Some(2),
        };
        let s = sampler("0", source.clone(), policy);
        let health = s.health.clone();

        s.run(CancellationToken::new()).await;

        assert_eq!(source.opens.load(Ordering::SeqCst), 3);
        assert_eq!(health.gpu_restarts(), 2);
        assert_eq!(health.gpu_malformed_lines(), 3);
    }

    #[tokio::test]
    async fn test_command_source_feeds_sampler() {
        let source = Arc::new(CommandSource::new(
            "sh",
            vec![
                "-c".to_string(),
                r"printf '0, 512, 10\n1, 1024, 55\n'".to_string(),
            ],
        ));
        let s = sampler("0,1", source, RestartPolicy::disabled());
        let metrics = s.metrics.clone();

        s.run(CancellationToken::new()).await;

        let mem = metrics.gpu_memory_used.snapshot();
        let util = metrics.gpu_utilization.snapshot();
        assert_eq!(mem["0"].value, MetricValue::Int(512));
        assert_eq!(mem["1"].value, MetricValue::Int(1024));
        assert_eq!(util["0"].value, MetricValue::Int(10));
        assert_eq!(util["1"].value, MetricValue::Int(55));
    }

    #[tokio::test]
    async fn test_spawn_failure_counts_restarts() {
        let source = Arc::new(CommandSource::new(
            "/nonexistent/resmon-gpu-telemetry",
            Vec::new(),
        ));
        assert!(source.open().await.is_err());

        let policy = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            max_restarts: Some(2),
        };
        let s = sampler("0", source, policy);
        let metrics = s.metrics.clone();
        let health = s.health.clone();

        s.run(CancellationToken::new()).await;

        assert_eq!(health.gpu_restarts(), 2);
        assert!(metrics.gpu_memory_used.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_restarts_until_limit() {
        let source = CannedSource::new("0, 100, 1\n");
        let policy = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            max_restarts: Some(3),
        };
        let s = sampler("0", source.clone(), policy);
        let health = s.health.clone();

        s.run(CancellationToken::new()).await;

        assert_eq!(source.opens.load(Ordering::SeqCst), 4);
        assert_eq!(health.gpu_restarts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let source = CannedSource::new("");
        let policy = RestartPolicy {
            enabled: true,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            max_restarts: None,
        };
        let s = sampler("0", source.clone(), policy);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(s.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }
}
