//! Relay server
//!
//! The listener accepts WebSocket subscribers on the configured path and
//! hands them to the gateway task, which owns the session registry.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod listener;

pub use config::{ServerConfig, STATS_PATH};
pub use gateway::{Command, Gateway, GatewayHandle, RecurringTimer};
pub use listener::RelayServer;
