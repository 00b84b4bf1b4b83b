//! Snapshot endpoint handler.
//!
//! Returns the same per-store payloads the reporter pushes, as one JSON
//! document.

use axum::{extract::State, Json};
use resmon_agent::store::Snapshot;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::state::SharedState;

#[derive(Serialize)]
pub struct SnapshotResponse {
    pub identity: String,
    pub cpu: Snapshot,
    pub gpu_memory_used: Snapshot,
    pub gpu_utilization: Snapshot,
}

/// Handler for the /snapshot endpoint.
#[instrument(skip(state))]
pub async fn snapshot_handler(State(state): State<SharedState>) -> Json<SnapshotResponse> {
    debug!("Processing /snapshot request");
    Json(SnapshotResponse {
        identity: state.identity.clone(),
        cpu: state.metrics.cpu.snapshot(),
        gpu_memory_used: state.metrics.gpu_memory_used.snapshot(),
        gpu_utilization: state.metrics.gpu_utilization.snapshot(),
    })
}
