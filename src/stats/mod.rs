//! Statistics for sessions and the gateway

pub mod metrics;

pub use metrics::{ServerStats, SessionStats, StatsSnapshot};
