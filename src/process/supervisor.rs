//! Transcoder process supervision
//!
//! A [`ProcessSupervisor`] owns exactly one transcoder process for one
//! session: it builds the invocation, starts it through a [`Launcher`],
//! tracks liveness and classifies the exit.

use std::fmt;
use std::str::FromStr;

use crate::registry::{RequestParams, SessionId};

use super::launcher::{CommandLine, EventSink, Launcher, ProcessExit, ProcessHandle, SpawnError};

/// Output container flags, fixed for every session
const OUTPUT_FORMAT_ARGS: [&str; 4] = ["-f", "mpegts", "-codec:v", "mpeg1video"];

/// Argument names the gateway sets itself and clients may not pass through
const RESERVED_OPTIONS: [&str; 12] = [
    "-i",
    "-rtsp_transport",
    "-f",
    "-codec:v",
    "-c:v",
    "-vcodec",
    "-y",
    "-n",
    "-loglevel",
    "-v",
    "-hide_banner",
    "-filter_script",
];

/// How the transcoder reaches the upstream source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransportMode {
    /// Interleaved over the RTSP TCP connection
    #[default]
    #[value(name = "tcp")]
    Tcp,
    /// Plain UDP
    #[value(name = "udp")]
    Udp,
    /// UDP multicast
    #[value(name = "udp_multicast")]
    UdpMulticast,
    /// Tunneled over HTTP
    #[value(name = "http")]
    Http,
    /// Tunneled over HTTPS
    #[value(name = "https")]
    Https,
}

impl TransportMode {
    /// Value passed after the transport flag
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Tcp => "tcp",
            TransportMode::Udp => "udp",
            TransportMode::UdpMulticast => "udp_multicast",
            TransportMode::Http => "http",
            TransportMode::Https => "https",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportMode::Tcp),
            "udp" => Ok(TransportMode::Udp),
            "udp_multicast" => Ok(TransportMode::UdpMulticast),
            "http" => Ok(TransportMode::Http),
            "https" => Ok(TransportMode::Https),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

/// Settings shared by every transcoder invocation
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Executable to spawn
    pub program: String,
    /// Transport used to reach the upstream source
    pub transport_mode: TransportMode,
    /// Arguments placed before everything else
    pub global_args: Vec<String>,
    /// Pass-through option names clients may use (empty = any well-formed name)
    pub allowed_options: Vec<String>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            transport_mode: TransportMode::Tcp,
            global_args: vec!["-hide_banner".into(), "-loglevel".into(), "error".into()],
            allowed_options: Vec::new(),
        }
    }
}

impl TranscoderConfig {
    /// Build the full invocation for one source
    ///
    /// Parameters that fail [`TranscoderConfig::check_option`] are skipped.
    pub fn command_line(&self, locator: &str, params: &RequestParams) -> CommandLine {
        let mut args = self.global_args.clone();
        args.extend([
            "-rtsp_transport".to_string(),
            self.transport_mode.as_str().to_string(),
            "-i".to_string(),
            locator.to_string(),
        ]);
        args.extend(OUTPUT_FORMAT_ARGS.iter().map(|s| s.to_string()));

        for (name, value) in params.options() {
            if value.trim().is_empty() {
                continue;
            }
            match self.check_option(name) {
                Ok(()) => {
                    args.push(name.to_string());
                    args.push(value.to_string());
                }
                Err(reason) => {
                    tracing::warn!(option = %name, reason = reason, "Pass-through option rejected");
                }
            }
        }

        args.push("-".into());

        CommandLine {
            program: self.program.clone(),
            args,
        }
    }

    /// Decide whether a client-supplied name may be forwarded as a flag
    pub fn check_option(&self, name: &str) -> Result<(), &'static str> {
        let mut chars = name.chars();
        if chars.next() != Some('-') {
            return Err("not a flag");
        }
        match chars.next() {
            Some(c) if c.is_ascii_alphanumeric() => {}
            _ => return Err("malformed flag"),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')) {
            return Err("malformed flag");
        }
        if RESERVED_OPTIONS.contains(&name) {
            return Err("reserved flag");
        }
        if !self.allowed_options.is_empty() && !self.allowed_options.iter().any(|o| o == name) {
            return Err("not allowed");
        }
        Ok(())
    }
}

/// Liveness of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not opened yet
    Pending,
    /// Running, no exit observed
    Running,
    /// Terminated because the supervisor asked it to
    ExitedVoluntarily,
    /// Terminated for any other reason, or never started
    ExitedAbnormally,
}

/// Classification of a process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Caused by [`ProcessSupervisor::close`]
    Voluntary,
    /// Anything else
    Abnormal,
}

/// Owner of one transcoder process
pub struct ProcessSupervisor {
    session: SessionId,
    command: CommandLine,
    state: ProcessState,
    exit_code: Option<i32>,
    handle: Option<Box<dyn ProcessHandle>>,
    close_requested: bool,
}

impl ProcessSupervisor {
    /// Create a supervisor for `locator`, forwarding the request's options
    pub fn new(
        session: SessionId,
        config: &TranscoderConfig,
        locator: &str,
        params: &RequestParams,
    ) -> Self {
        Self {
            session,
            command: config.command_line(locator, params),
            state: ProcessState::Pending,
            exit_code: None,
            handle: None,
            close_requested: false,
        }
    }

    /// Start the process
    ///
    /// On failure the supervisor is left in [`ProcessState::ExitedAbnormally`].
    /// Opening a supervisor that is not pending is a no-op.
    pub fn open(&mut self, launcher: &dyn Launcher, events: EventSink) -> Result<(), SpawnError> {
        if self.state != ProcessState::Pending {
            return Ok(());
        }

        match launcher.launch(&self.command, events) {
            Ok(handle) => {
                tracing::info!(
                    session_id = %self.session,
                    pid = ?handle.id(),
                    "Transcoder started"
                );
                self.handle = Some(handle);
                self.state = ProcessState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = ProcessState::ExitedAbnormally;
                Err(e)
            }
        }
    }

    /// Whether the process is presumed running (no exit observed yet)
    pub fn status(&self) -> bool {
        self.state == ProcessState::Running
    }

    /// Current liveness state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit code, once an exit was recorded
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Record the process exit and classify it
    pub fn record_exit(&mut self, exit: ProcessExit) -> ExitKind {
        let kind = if exit.requested || self.close_requested {
            ExitKind::Voluntary
        } else {
            ExitKind::Abnormal
        };

        self.exit_code = exit.code;
        self.handle = None;
        self.state = match kind {
            ExitKind::Voluntary => ProcessState::ExitedVoluntarily,
            ExitKind::Abnormal => ProcessState::ExitedAbnormally,
        };

        kind
    }

    /// Ask the process to terminate
    ///
    /// Idempotent; does nothing if the process was never started or has
    /// already been closed.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.close_requested = true;
            handle.terminate();
            tracing::debug!(session_id = %self.session, "Transcoder termination requested");
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("session", &self.session)
            .field("command", &self.command)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::SessionKey;

    struct CountingHandle(Arc<AtomicUsize>);

    impl ProcessHandle for CountingHandle {
        fn terminate(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingLauncher {
        terminations: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Launcher for CountingLauncher {
        fn launch(
            &self,
            command: &CommandLine,
            _events: EventSink,
        ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
            if self.fail {
                return Err(SpawnError {
                    program: command.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                });
            }
            Ok(Box::new(CountingHandle(Arc::clone(&self.terminations))))
        }
    }

    fn sink() -> EventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSink::new(SessionKey::derive("/p", &RequestParams::new()), SessionId::new(1), tx)
    }

    fn launcher(fail: bool) -> (CountingLauncher, Arc<AtomicUsize>) {
        let terminations = Arc::new(AtomicUsize::new(0));
        (
            CountingLauncher {
                terminations: Arc::clone(&terminations),
                fail,
            },
            terminations,
        )
    }

    #[test]
    fn test_command_line_layout() {
        let config = TranscoderConfig {
            global_args: vec![],
            ..Default::default()
        };
        let params = RequestParams::from_iter([("url", "ignored"), ("-r", "25"), ("-b:v", "800k")]);

        let command = config.command_line("rtsp://cam/1", &params);

        assert_eq!(command.program, "ffmpeg");
        assert_eq!(
            command.args,
            vec![
                "-rtsp_transport", "tcp", "-i", "rtsp://cam/1", "-f", "mpegts", "-codec:v",
                "mpeg1video", "-b:v", "800k", "-r", "25", "-",
            ]
        );
    }

    #[test]
    fn test_global_args_come_first() {
        let config = TranscoderConfig {
            transport_mode: TransportMode::Udp,
            ..Default::default()
        };
        let command = config.command_line("rtsp://cam/1", &RequestParams::new());

        assert_eq!(&command.args[..5], &["-hide_banner", "-loglevel", "error", "-rtsp_transport", "udp"]);
        assert_eq!(command.args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_blank_options_are_not_forwarded() {
        let config = TranscoderConfig::default();
        let params = RequestParams::from_iter([("-r", "  "), ("-s", "")]);

        let command = config.command_line("rtsp://cam/1", &params);
        assert!(!command.args.iter().any(|a| a == "-r" || a == "-s"));
    }

    #[test]
    fn test_option_values_forwarded_verbatim() {
        let config = TranscoderConfig::default();
        let params = RequestParams::from_query("-vf=+scale%3D640%3A-1+");

        let command = config.command_line("rtsp://cam/1", &params);
        let at = command.args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(command.args[at + 1], " scale=640:-1 ");
    }

    #[test]
    fn test_option_sanitizing() {
        let config = TranscoderConfig::default();

        assert!(config.check_option("-b:v").is_ok());
        assert!(config.check_option("-max_delay").is_ok());
        assert_eq!(config.check_option("a"), Err("not a flag"));
        assert_eq!(config.check_option("-"), Err("malformed flag"));
        assert_eq!(config.check_option("--"), Err("malformed flag"));
        assert_eq!(config.check_option("-r;rm"), Err("malformed flag"));
        assert_eq!(config.check_option("-i"), Err("reserved flag"));
        assert_eq!(config.check_option("-rtsp_transport"), Err("reserved flag"));
    }

    #[test]
    fn test_allowlist() {
        let config = TranscoderConfig {
            allowed_options: vec!["-r".into()],
            ..Default::default()
        };

        assert!(config.check_option("-r").is_ok());
        assert_eq!(config.check_option("-s"), Err("not allowed"));
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!("udp_multicast".parse::<TransportMode>().unwrap(), TransportMode::UdpMulticast);
        assert_eq!(TransportMode::Https.to_string(), "https");
        assert!("sctp".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_open_and_close() {
        let (launcher, terminations) = launcher(false);
        let mut supervisor = ProcessSupervisor::new(
            SessionId::new(1),
            &TranscoderConfig::default(),
            "rtsp://cam/1",
            &RequestParams::new(),
        );

        // Closing before open is a no-op
        supervisor.close();
        assert_eq!(supervisor.state(), ProcessState::Pending);

        supervisor.open(&launcher, sink()).unwrap();
        assert!(supervisor.status());

        supervisor.close();
        supervisor.close();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);

        let kind = supervisor.record_exit(ProcessExit {
            code: None,
            requested: true,
        });
        assert_eq!(kind, ExitKind::Voluntary);
        assert_eq!(supervisor.state(), ProcessState::ExitedVoluntarily);
        assert!(!supervisor.status());
    }

    #[test]
    fn test_unrequested_exit_is_abnormal() {
        let (launcher, _) = launcher(false);
        let mut supervisor = ProcessSupervisor::new(
            SessionId::new(1),
            &TranscoderConfig::default(),
            "rtsp://cam/1",
            &RequestParams::new(),
        );
        supervisor.open(&launcher, sink()).unwrap();

        let kind = supervisor.record_exit(ProcessExit {
            code: Some(0),
            requested: false,
        });
        assert_eq!(kind, ExitKind::Abnormal);
        assert_eq!(supervisor.exit_code(), Some(0));
    }

    #[test]
    fn test_spawn_failure_is_abnormal() {
        let (launcher, terminations) = launcher(true);
        let mut supervisor = ProcessSupervisor::new(
            SessionId::new(1),
            &TranscoderConfig::default(),
            "rtsp://cam/1",
            &RequestParams::new(),
        );

        assert!(supervisor.open(&launcher, sink()).is_err());
        assert_eq!(supervisor.state(), ProcessState::ExitedAbnormally);

        supervisor.close();
        assert_eq!(terminations.load(Ordering::SeqCst), 0);
    }
}
