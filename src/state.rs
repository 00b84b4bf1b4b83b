//! Application state management for the status server.
//!
//! This module defines the shared state passed to the HTTP handlers: the
//! agent's stores and health counters plus the Prometheus registry exposing
//! them.

use prometheus::{Gauge, Registry};
use resmon_agent::{AgentMetrics, Config, HealthStats};
use std::sync::Arc;

use crate::metrics::AgentGauges;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// State shared across status requests.
pub struct AppState {
    pub registry: Registry,
    pub gauges: AgentGauges,
    pub scrape_duration: Gauge,
    pub metrics: Arc<AgentMetrics>,
    pub health_stats: Arc<HealthStats>,
    pub config: Arc<Config>,
    pub identity: String,
    pub gpu_enabled: bool,
}

impl AppState {
    pub fn new(
        metrics: Arc<AgentMetrics>,
        health_stats: Arc<HealthStats>,
        config: Arc<Config>,
        identity: String,
        gpu_enabled: bool,
    ) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let gauges = AgentGauges::new(&registry)?;
        let scrape_duration = Gauge::new(
            "resmon_scrape_duration_seconds",
            "Time spent serving /metrics request",
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        Ok(Self {
            registry,
            gauges,
            scrape_duration,
            metrics,
            health_stats,
            config,
            identity,
            gpu_enabled,
        })
    }
}
