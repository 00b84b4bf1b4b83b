//! CLI command implementations for resmon-agent.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: /proc, pid resolution and GPU command validation
//! - `config`: Configuration file generation
//! - `sample`: One-off process tree sampling

pub mod check;
pub mod config;
pub mod sample;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use sample::command_sample;
