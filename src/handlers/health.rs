//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns
//! agent health statistics.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use resmon_agent::store::CPU_UTILIZATION_KEY;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "resmon-agent - resource telemetry for compute tasks";

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    // Healthy once the process tree has been sampled at least once
    let sampled = state.metrics.cpu.get(CPU_UTILIZATION_KEY).is_some();
    let status = if sampled {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let message = if sampled {
        "OK"
    } else if state.health_stats.resolve_failures() > 0 {
        "Monitored process not resolved yet"
    } else {
        "Waiting for first sample"
    };

    let table = state.health_stats.render_table();

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!(
            "{message}\n\nidentity: {}\ngpu monitoring: {}\n\n{table}\n{FOOTER_TEXT}",
            state.identity, state.gpu_enabled
        ),
    )
}
