//! Documentation endpoint handler.
//!
//! This module provides the `/doc` endpoint handler that describes the
//! agent's endpoints, metrics and reporting payloads.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

/// Handler for the /doc endpoint.
#[instrument(skip(state))]
pub async fn doc_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /doc request");

    let version = env!("CARGO_PKG_VERSION");
    let cfg = &state.config;
    let doc = format!(
        r#"RESMON AGENT - DOCUMENTATION
============================

VERSION: {version}
IDENTITY: {identity}
DESCRIPTION: Resource telemetry agent for a running compute task

HTTP ENDPOINTS
--------------
GET /metrics     - Prometheus rendering of the latest samples
GET /health      - Health check with internal statistics (plain text)
GET /snapshot    - Latest samples of all three stores (JSON)
GET /doc         - This documentation (plain text)

REPORTED PAYLOADS
-----------------
reportCpuMetrics       {{"CPUMEM": [ts_ms, gb], "CPUUTIL": [ts_ms, percent]}}
reportGpuMemoryUsed    {{"<device>": [ts_ms, used], ...}}
reportGpuUtilization   {{"<device>": [ts_ms, percent], ...}}

GPU calls are only made when a GPU list was configured (currently: {gpu}).

AVAILABLE METRICS
-----------------
resmon_cpu_memory_gigabytes          - Resident memory of the process tree
resmon_cpu_utilization_percent       - CPU usage of the process tree
resmon_gpu_memory_used_mib           - GPU memory used per device
resmon_gpu_utilization_percent       - GPU utilization per device
resmon_sample_age_seconds            - Age of each stored sample
resmon_sample_ticks_total            - Process-tree sampling ticks
resmon_sample_failures_total         - Failed sampling ticks
resmon_reports_sent_total            - Successful pushes per call
resmon_report_failures_total         - Failed pushes per call
resmon_gpu_stream_restarts_total     - Relaunches of the GPU command
resmon_scrape_duration_seconds       - Time spent serving /metrics

EFFECTIVE TIMING
----------------
sample interval:  {sample:?}
report interval:  {report:?}
proc root:        {proc_root}

{FOOTER_TEXT}
"#,
        identity = state.identity,
        gpu = state.gpu_enabled,
        sample = cfg.sample_interval(),
        report = cfg.report_interval(),
        proc_root = cfg.proc_root().display(),
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        doc,
    )
}
