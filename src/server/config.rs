//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{TranscoderConfig, TransportMode, DEFAULT_READ_CHUNK_SIZE};
use crate::registry::RegistryConfig;

/// Path of the JSON statistics endpoint
pub const STATS_PATH: &str = "/stats";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Path subscribers connect to
    pub path: String,

    /// Transcoder invocation settings
    pub transcoder: TranscoderConfig,

    /// Idle reclamation settings
    pub registry: RegistryConfig,

    /// Per-subscriber outbound queue length, in chunks
    pub send_queue: usize,

    /// Maximum bytes per transcoder stdout read
    pub read_chunk_size: usize,

    /// Capacity of the command channel into the gateway task
    pub command_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9999)),
            path: "/proxy".into(),
            transcoder: TranscoderConfig::default(),
            registry: RegistryConfig::default(),
            send_queue: 256,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            command_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the listen port, keeping the bind IP
    pub fn port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Set the subscriber path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the transcoder executable
    pub fn transcoder_path(mut self, program: impl Into<String>) -> Self {
        self.transcoder.program = program.into();
        self
    }

    /// Set the upstream transport mode
    pub fn transport_mode(mut self, mode: TransportMode) -> Self {
        self.transcoder.transport_mode = mode;
        self
    }

    /// Replace the arguments placed before the input
    pub fn global_args(mut self, args: Vec<String>) -> Self {
        self.transcoder.global_args = args;
        self
    }

    /// Restrict pass-through options to the given names
    pub fn allowed_options(mut self, names: Vec<String>) -> Self {
        self.transcoder.allowed_options = names;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.registry.idle_timeout = timeout;
        self
    }

    /// Set the idle scan period
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.registry.check_interval = interval;
        self
    }

    /// Set the per-subscriber queue length
    pub fn send_queue(mut self, chunks: usize) -> Self {
        self.send_queue = chunks;
        self
    }

    /// Set the maximum stdout read size
    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::Config(format!("path must start with '/': {}", self.path)));
        }
        if self.path == STATS_PATH {
            return Err(Error::Config(format!("path {} is reserved", STATS_PATH)));
        }
        self.registry.validate()?;
        if self.send_queue == 0 {
            return Err(Error::Config("send queue must hold at least one chunk".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read chunk size must be positive".into()));
        }
        if self.command_queue == 0 {
            return Err(Error::Config("command queue must be positive".into()));
        }
        if self.transcoder.program.trim().is_empty() {
            return Err(Error::Config("transcoder path is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.path, "/proxy");
        assert_eq!(config.transcoder.program, "ffmpeg");
        assert_eq!(config.transcoder.transport_mode, TransportMode::Tcp);
        assert_eq!(config.registry.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.registry.check_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr, addr);
    }

    #[test]
    fn test_builder_port_keeps_ip() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::with_addr(addr).port(9100);

        assert_eq!(config.bind_addr, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_builder_chaining() {
        let config = ServerConfig::default()
            .port(8080)
            .path("/live")
            .transcoder_path("/usr/local/bin/ffmpeg")
            .transport_mode(TransportMode::Udp)
            .allowed_options(vec!["-r".into()])
            .idle_timeout(Duration::from_secs(120))
            .check_interval(Duration::from_secs(5))
            .send_queue(32)
            .read_chunk_size(4096);

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.path, "/live");
        assert_eq!(config.transcoder.program, "/usr/local/bin/ffmpeg");
        assert_eq!(config.transcoder.transport_mode, TransportMode::Udp);
        assert_eq!(config.transcoder.allowed_options, vec!["-r".to_string()]);
        assert_eq!(config.registry.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.registry.check_interval, Duration::from_secs(5));
        assert_eq!(config.send_queue, 32);
        assert_eq!(config.read_chunk_size, 4096);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::default().path("proxy").validate().is_err());
        assert!(ServerConfig::default().path(STATS_PATH).validate().is_err());
        assert!(ServerConfig::default()
            .check_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ServerConfig::default().send_queue(0).validate().is_err());
        assert!(ServerConfig::default().read_chunk_size(0).validate().is_err());
        assert!(ServerConfig::default().transcoder_path(" ").validate().is_err());
    }
}
