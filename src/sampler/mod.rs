//! Background samplers writing into the metrics store.
//!
//! - `cpu`: process-tree memory and CPU utilization on a fixed interval
//! - `gpu`: per-device readings from a continuously running telemetry command
//! - `backoff`: restart delays for the GPU telemetry stream

pub mod backoff;
pub mod cpu;
pub mod gpu;

pub use backoff::{Backoff, RestartPolicy};
pub use cpu::CpuSampler;
pub use gpu::{GpuDeviceList, GpuSampler};
