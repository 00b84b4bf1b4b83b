//! Last-value metrics store shared by the samplers and the reporter.
//!
//! Every key holds exactly one [`MetricSample`]: a write replaces the
//! previous value and no history is kept. Readers take owned snapshots so a
//! push to the reporting channel never holds the lock.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Key of the process-tree resident memory sample (gigabytes).
pub const CPU_MEMORY_KEY: &str = "CPUMEM";

/// Key of the process-tree CPU utilization sample (percent).
pub const CPU_UTILIZATION_KEY: &str = "CPUUTIL";

/// Numeric payload of a sample.
///
/// Integers serialize without a decimal point, floats always with one, so
/// `Int(37)` renders as `37` and `Float(2.0)` as `2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }
}

/// A single reading, serialized as `[timestampMillis, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(i64, MetricValue)", into = "(i64, MetricValue)")]
pub struct MetricSample {
    pub timestamp_millis: i64,
    pub value: MetricValue,
}

impl MetricSample {
    pub fn new(timestamp_millis: i64, value: MetricValue) -> Self {
        Self {
            timestamp_millis,
            value,
        }
    }

    pub fn int(timestamp_millis: i64, value: i64) -> Self {
        Self::new(timestamp_millis, MetricValue::Int(value))
    }

    pub fn float(timestamp_millis: i64, value: f64) -> Self {
        Self::new(timestamp_millis, MetricValue::Float(value))
    }
}

impl From<(i64, MetricValue)> for MetricSample {
    fn from((timestamp_millis, value): (i64, MetricValue)) -> Self {
        Self {
            timestamp_millis,
            value,
        }
    }
}

impl From<MetricSample> for (i64, MetricValue) {
    fn from(sample: MetricSample) -> Self {
        (sample.timestamp_millis, sample.value)
    }
}

/// Point-in-time copy of a store, sorted by key.
pub type Snapshot = BTreeMap<String, MetricSample>;

/// Thread-safe key -> latest sample map.
#[derive(Debug, Default)]
pub struct MetricsStore {
    entries: RwLock<HashMap<String, MetricSample>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the sample stored under `key`.
    pub fn put(&self, key: impl Into<String>, sample: MetricSample) {
        // A poisoned lock still guards a consistent map: every write is a
        // single insert.
        let mut guard = match self.entries.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(key.into(), sample);
    }

    pub fn get(&self, key: &str) -> Option<MetricSample> {
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(key).copied()
    }

    /// Owned copy of every entry at the moment of the call.
    pub fn snapshot(&self) -> Snapshot {
        let guard = match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Snapshot rendered as the JSON payload handed to the reporting channel.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(g) => g.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three stores written by the samplers.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    /// `CPUMEM` and `CPUUTIL`.
    pub cpu: MetricsStore,
    /// GPU memory used, keyed by device identifier.
    pub gpu_memory_used: MetricsStore,
    /// GPU utilization, keyed by device identifier.
    pub gpu_utilization: MetricsStore,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_overwrites_existing_key() {
        let store = MetricsStore::new();
        store.put(CPU_UTILIZATION_KEY, MetricSample::int(1, 10));
        store.put(CPU_UTILIZATION_KEY, MetricSample::int(2, 20));

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(CPU_UTILIZATION_KEY),
            Some(MetricSample::int(2, 20))
        );
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let store = MetricsStore::new();
        store.put("0", MetricSample::int(1, 512));
        let snap = store.snapshot();

        store.put("0", MetricSample::int(2, 1024));
        store.put("1", MetricSample::int(2, 64));

        assert_eq!(snap.len(), 1);
        assert_eq!(snap["0"], MetricSample::int(1, 512));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_store_serializes_to_empty_object() {
        let store = MetricsStore::new();
        assert!(store.is_empty());
        assert_eq!(store.snapshot_json().unwrap(), "{}");
    }

    #[test]
    fn test_sample_serializes_as_pair() {
        let store = MetricsStore::new();
        store.put(CPU_MEMORY_KEY, MetricSample::float(1700000000000, 2.0));
        store.put(CPU_UTILIZATION_KEY, MetricSample::int(1700000000000, 37));

        let json = store.snapshot_json().unwrap();
        assert_eq!(
            json,
            r#"{"CPUMEM":[1700000000000,2.0],"CPUUTIL":[1700000000000,37]}"#
        );

        let parsed: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["CPUUTIL"].value, MetricValue::Int(37));
        assert_eq!(parsed["CPUMEM"].value, MetricValue::Float(2.0));
    }

    #[test]
    fn test_concurrent_writers_keep_one_entry_per_key() {
        let store = Arc::new(MetricsStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        store.put(format!("{}", i % 2), MetricSample::int(n, n));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 2);
    }
}
