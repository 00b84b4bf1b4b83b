//! JSON-lines reporting channel.
//!
//! Writes one JSON object per call to stdout or an append-mode file, for a
//! coordinator-side collector to tail:
//!
//! ```text
//! {"ts":1700000000000,"call":"reportCpuMetrics","identity":"c_01","payload":"{\"CPUMEM\":[...]}"}
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use super::{ReportCall, ReportError, ReportingChannel};
use crate::store::now_millis;

#[derive(Serialize)]
struct Envelope<'a> {
    ts: i64,
    call: &'static str,
    identity: &'a str,
    payload: &'a str,
}

pub struct JsonLinesChannel {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesChannel {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Appends to `path`, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self, ReportError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    /// `"-"` selects stdout, anything else is a file path.
    pub fn for_output(output: &str) -> Result<Self, ReportError> {
        if output == "-" {
            Ok(Self::stdout())
        } else {
            Self::append_to(Path::new(output))
        }
    }

    fn write(&self, call: ReportCall, identity: &str, payload: &str) -> Result<(), ReportError> {
        let mut line = serde_json::to_vec(&Envelope {
            ts: now_millis(),
            call: call.as_str(),
            identity,
            payload,
        })?;
        line.push(b'\n');

        let mut out = self
            .out
            .lock()
            .map_err(|_| ReportError::Transport("output lock poisoned".into()))?;
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ReportingChannel for JsonLinesChannel {
    async fn report_cpu_metrics(&self, identity: &str, payload: &str) -> Result<(), ReportError> {
        self.write(ReportCall::CpuMetrics, identity, payload)
    }

    async fn report_gpu_memory_used(
        &self,
        identity: &str,
        payload: &str,
    ) -> Result<(), ReportError> {
        self.write(ReportCall::GpuMemoryUsed, identity, payload)
    }

    async fn report_gpu_utilization(
        &self,
        identity: &str,
        payload: &str,
    ) -> Result<(), ReportError> {
        self.write(ReportCall::GpuUtilization, identity, payload)
    }
}
