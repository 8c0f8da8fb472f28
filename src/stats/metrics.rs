//! Statistics and metrics for relay sessions

use std::time::Duration;

use serde::Serialize;

use crate::registry::{Session, TeardownReason};

/// Session-level statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session key
    pub key: String,
    /// Session id
    pub session_id: u64,
    /// Number of current subscribers
    pub subscribers: usize,
    /// Chunks broadcast so far
    pub chunks_sent: u64,
    /// Payload bytes broadcast so far
    pub bytes_sent: u64,
    /// Seconds with zero subscribers, as counted by the idle scan
    pub idle_secs: Option<u64>,
    /// Seconds since the session was created
    pub age_secs: u64,
    /// Average output bitrate in bits per second
    pub bitrate_bps: u64,
    /// Whether the transcoder is presumed running
    pub running: bool,
}

impl SessionStats {
    /// Capture statistics of a live session
    pub fn from_session(session: &Session, idle: Option<Duration>) -> Self {
        let age_secs = session.created_at.elapsed().as_secs();
        Self {
            key: session.key.to_string(),
            session_id: session.id.get(),
            subscribers: session.subscriber_count(),
            chunks_sent: session.chunks_sent,
            bytes_sent: session.bytes_sent,
            idle_secs: idle.map(|d| d.as_secs()),
            age_secs,
            bitrate_bps: bitrate(session.bytes_sent, age_secs),
            running: session.supervisor.status(),
        }
    }
}

/// Average bitrate over `secs` seconds
fn bitrate(bytes: u64, secs: u64) -> u64 {
    if secs > 0 {
        (bytes * 8) / secs
    } else {
        0
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Sessions ever created
    pub sessions_created: u64,
    /// Sessions torn down because the transcoder failed or exited
    pub sessions_failed: u64,
    /// Sessions whose transcoder could not be started
    pub spawn_failures: u64,
    /// Sessions reclaimed by the idle scan
    pub sessions_reaped: u64,
    /// Sessions torn down at shutdown
    pub sessions_shutdown: u64,
    /// Sessions torn down for any reason
    pub sessions_torn_down: u64,
    /// Subscribers accepted into a session
    pub subscribers_accepted: u64,
    /// Requests rejected before a session was found or created
    pub requests_rejected: u64,
    /// Sessions live at snapshot time
    pub active_sessions: u64,
    /// Subscribers connected at snapshot time
    pub active_subscribers: u64,
}

impl ServerStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one teardown under its reason
    pub fn record_teardown(&mut self, reason: TeardownReason) {
        self.sessions_torn_down += 1;
        match reason {
            TeardownReason::UpstreamError | TeardownReason::UpstreamExit => {
                self.sessions_failed += 1
            }
            TeardownReason::SpawnFailed => self.spawn_failures += 1,
            TeardownReason::Idle => self.sessions_reaped += 1,
            TeardownReason::Shutdown => self.sessions_shutdown += 1,
        }
    }
}

/// Statistics served on the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Server-wide counters
    pub server: ServerStats,
    /// Live sessions ordered by key
    pub sessions: Vec<SessionStats>,
}
