//! HTTP endpoint handlers for the status server.
//!
//! This module provides handlers for all HTTP endpoints:
//! - `/metrics`: Prometheus rendering of the latest samples
//! - `/health`: Health check endpoint
//! - `/snapshot`: JSON of the three metric stores
//! - `/doc`: Documentation endpoint

pub mod doc;
pub mod health;
pub mod metrics;
pub mod snapshot;

// Re-export handlers
pub use doc::doc_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use snapshot::snapshot_handler;
