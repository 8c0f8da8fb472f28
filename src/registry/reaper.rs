//! Idle session tracking
//!
//! Every session is tracked from creation. Each scan adds one check
//! interval to the idle time of sessions without subscribers and resets
//! it for sessions that have any. Sessions whose idle time reaches the
//! threshold are handed back to the registry for teardown.

use std::collections::HashMap;
use std::time::Duration;

use super::config::RegistryConfig;
use super::key::SessionKey;

/// Per-key idle bookkeeping
#[derive(Debug)]
pub struct IdleReaper {
    check_interval: Duration,
    idle_timeout: Duration,
    tracked: HashMap<SessionKey, Duration>,
}

impl IdleReaper {
    /// Create a reaper from registry configuration
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            idle_timeout: config.idle_timeout,
            tracked: HashMap::new(),
        }
    }

    /// Start tracking a key with zero idle time
    pub fn track(&mut self, key: SessionKey) {
        self.tracked.insert(key, Duration::ZERO);
    }

    /// Stop tracking a key
    pub fn untrack(&mut self, key: &SessionKey) {
        self.tracked.remove(key);
    }

    /// Accumulated idle time of a key
    pub fn idle_elapsed(&self, key: &SessionKey) -> Option<Duration> {
        self.tracked.get(key).copied()
    }

    /// Number of tracked keys
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Run one scan
    ///
    /// `subscribers` reports the subscriber count of the live session for a
    /// key, or `None` when no live session exists (the key is pruned).
    /// Returns the keys that reached the idle threshold; they are no longer
    /// tracked when this returns.
    pub fn scan<F>(&mut self, mut subscribers: F) -> Vec<SessionKey>
    where
        F: FnMut(&SessionKey) -> Option<usize>,
    {
        let mut expired = Vec::new();
        let check_interval = self.check_interval;
        let idle_timeout = self.idle_timeout;

        self.tracked.retain(|key, idle| match subscribers(key) {
            None => false,
            Some(0) => {
                *idle += check_interval;
                tracing::debug!(session = %key, idle_secs = idle.as_secs(), "Session idle");
                if *idle >= idle_timeout {
                    expired.push(key.clone());
                    false
                } else {
                    true
                }
            }
            Some(_) => {
                *idle = Duration::ZERO;
                true
            }
        });

        expired
    }
}
