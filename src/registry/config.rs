//! Registry configuration

use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for session reclamation
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a session may have zero subscribers before it is reaped
    pub idle_timeout: Duration,

    /// Period of the idle scan
    pub check_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the idle scan period
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Check that the idle scan can run
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::Config("check interval must be positive".into()));
        }
        Ok(())
    }
}
