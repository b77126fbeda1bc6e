//! Health tracking for the telemetry hub.
//!
//! Counters and link states feeding the heartbeat log and the end-of-session
//! summary.

pub mod stats;

// Re-export commonly used types
pub use stats::{create_shared_health, HealthStats, PipelineHealth, SharedHealth};
