//! Transcoder process launching
//!
//! The registry never touches OS process primitives directly. It asks a
//! [`Launcher`] to start a command and gets back a [`ProcessHandle`] it can
//! terminate. Output and exit are reported asynchronously through an
//! [`EventSink`] as [`ProcessNotification`]s.

use std::process::Stdio;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::registry::{SessionId, SessionKey};

/// Default size of a single stdout read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Program and arguments of a transcoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable to run
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
}

/// How a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code (None if killed by a signal or the status was unavailable)
    pub code: Option<i32>,
    /// Whether termination was requested through the process handle
    pub requested: bool,
}

/// Something a running process produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One read from standard output
    Chunk(Bytes),
    /// One read from standard error
    Stderr(Bytes),
    /// The process terminated (sent exactly once)
    Exited(ProcessExit),
}

/// A process event tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct ProcessNotification {
    /// Key of the owning session
    pub key: SessionKey,
    /// Identity of the owning session, distinguishes reuses of a key
    pub session: SessionId,
    /// The event itself
    pub event: ProcessEvent,
}

/// Delivery side of the notification channel for one process
#[derive(Debug, Clone)]
pub struct EventSink {
    key: SessionKey,
    session: SessionId,
    tx: mpsc::UnboundedSender<ProcessNotification>,
}

impl EventSink {
    /// Create a sink that tags every event with `key` and `session`
    pub fn new(
        key: SessionKey,
        session: SessionId,
        tx: mpsc::UnboundedSender<ProcessNotification>,
    ) -> Self {
        Self { key, session, tx }
    }

    /// Session this sink reports for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Report a stdout chunk
    ///
    /// Returns false if nobody is listening anymore.
    pub fn chunk(&self, data: Bytes) -> bool {
        self.emit(ProcessEvent::Chunk(data))
    }

    /// Report a stderr chunk
    pub fn stderr(&self, data: Bytes) -> bool {
        self.emit(ProcessEvent::Stderr(data))
    }

    /// Report termination
    pub fn exited(&self, exit: ProcessExit) -> bool {
        self.emit(ProcessEvent::Exited(exit))
    }

    fn emit(&self, event: ProcessEvent) -> bool {
        self.tx
            .send(ProcessNotification {
                key: self.key.clone(),
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Failure to start a process
#[derive(Debug, Error)]
#[error("failed to spawn `{program}`: {source}")]
pub struct SpawnError {
    /// Program that could not be started
    pub program: String,
    /// Underlying OS error
    #[source]
    pub source: std::io::Error,
}

/// Control side of a launched process
pub trait ProcessHandle: Send {
    /// Ask the process to terminate
    ///
    /// Calling this more than once has no further effect.
    fn terminate(&mut self);

    /// OS process id, if known
    fn id(&self) -> Option<u32> {
        None
    }
}

/// Capability to start transcoder processes
pub trait Launcher: Send + Sync {
    /// Start `command`, reporting its output and exit through `events`
    ///
    /// A returned error means no process exists and no events will follow.
    fn launch(
        &self,
        command: &CommandLine,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

/// Launcher backed by `tokio::process`
///
/// Each process gets a driver task that pumps stdout and stderr into the
/// event sink and reports the exit status once both streams are closed.
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    read_chunk_size: usize,
}

impl TokioLauncher {
    /// Create a launcher with the default read size
    pub fn new() -> Self {
        Self::with_read_chunk_size(DEFAULT_READ_CHUNK_SIZE)
    }

    /// Create a launcher that reads stdout in chunks of at most `size` bytes
    pub fn with_read_chunk_size(size: usize) -> Self {
        Self {
            read_chunk_size: size.max(1),
        }
    }
}

impl Default for TokioLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for TokioLauncher {
    fn launch(
        &self,
        command: &CommandLine,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();

        tracing::debug!(
            session_id = %events.session(),
            pid = ?pid,
            program = %command.program,
            "Transcoder spawned"
        );

        tokio::spawn(drive(child, kill_rx, events, self.read_chunk_size));

        Ok(Box::new(TokioProcess {
            kill_tx: Some(kill_tx),
            pid,
        }))
    }
}

struct TokioProcess {
    kill_tx: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

impl ProcessHandle for TokioProcess {
    fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

/// Pump a child's output into `events` until it exits
///
/// A dropped kill sender counts as a termination request.
async fn drive(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    events: EventSink,
    chunk_size: usize,
) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = BytesMut::with_capacity(chunk_size);
    let mut err_buf = BytesMut::with_capacity(chunk_size);
    let mut requested = false;

    let status = loop {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf, chunk_size), if stdout.is_some() => {
                match read {
                    Ok(0) => stdout = None,
                    Ok(_) => {
                        events.chunk(out_buf.split().freeze());
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %events.session(), error = %e, "Transcoder stdout read failed");
                        stdout = None;
                    }
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf, chunk_size), if stderr.is_some() => {
                match read {
                    Ok(0) => stderr = None,
                    Ok(_) => {
                        let data = err_buf.split().freeze();
                        tracing::warn!(
                            session_id = %events.session(),
                            output = %String::from_utf8_lossy(&data).trim_end(),
                            "Transcoder wrote to stderr"
                        );
                        events.stderr(data);
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %events.session(), error = %e, "Transcoder stderr read failed");
                        stderr = None;
                    }
                }
            }
            _ = &mut kill_rx, if !requested => {
                requested = true;
                if let Err(e) = child.start_kill() {
                    tracing::debug!(session_id = %events.session(), error = %e, "Transcoder kill failed");
                }
            }
            status = child.wait(), if stdout.is_none() && stderr.is_none() => break status,
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::debug!(session_id = %events.session(), error = %e, "Transcoder wait failed");
            None
        }
    };

    tracing::debug!(
        session_id = %events.session(),
        code = ?code,
        requested = requested,
        "Transcoder exited"
    );

    events.exited(ProcessExit { code, requested });
}

async fn read_chunk<R>(
    reader: &mut Option<R>,
    buf: &mut BytesMut,
    chunk_size: usize,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => {
            buf.reserve(chunk_size);
            reader.read_buf(&mut buf.limit(chunk_size)).await
        }
        None => Ok(0),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<ProcessNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = SessionKey::derive("/proxy", &Default::default());
        (EventSink::new(key, SessionId::new(7), tx), rx)
    }

    fn sh(script: &str) -> CommandLine {
        CommandLine {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ProcessNotification>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(n) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("process did not finish in time")
        {
            assert_eq!(n.session, SessionId::new(7));
            let done = matches!(n.event, ProcessEvent::Exited(_));
            events.push(n.event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_stdout_then_exit() {
        let (events, rx) = sink();
        let _handle = TokioLauncher::new()
            .launch(&sh("printf hello"), events)
            .unwrap();

        let events = collect(rx).await;
        let output: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Chunk(data) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();

        assert_eq!(output, b"hello");
        assert_eq!(
            events.last(),
            Some(&ProcessEvent::Exited(ProcessExit {
                code: Some(0),
                requested: false,
            }))
        );
    }

    #[tokio::test]
    async fn test_stderr_is_reported() {
        let (events, rx) = sink();
        let _handle = TokioLauncher::new()
            .launch(&sh("printf oops >&2; exit 3"), events)
            .unwrap();

        let events = collect(rx).await;
        assert!(events.iter().any(|e| matches!(e, ProcessEvent::Stderr(_))));
        assert_eq!(
            events.last(),
            Some(&ProcessEvent::Exited(ProcessExit {
                code: Some(3),
                requested: false,
            }))
        );
    }

    #[tokio::test]
    async fn test_terminate_is_requested_exit() {
        let (events, rx) = sink();
        let mut handle = TokioLauncher::new()
            .launch(&sh("exec sleep 30"), events)
            .unwrap();

        handle.terminate();
        handle.terminate();

        let events = collect(rx).await;
        match events.last() {
            Some(ProcessEvent::Exited(exit)) => {
                assert!(exit.requested);
                assert_eq!(exit.code, None);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (events, _rx) = sink();
        let command = CommandLine {
            program: "/nonexistent/transcoder".into(),
            args: vec![],
        };

        let err = TokioLauncher::new().launch(&command, events).err().unwrap();
        assert_eq!(err.program, "/nonexistent/transcoder");
    }

    #[tokio::test]
    async fn test_reads_bounded_by_chunk_size() {
        let (events, rx) = sink();
        let _handle = TokioLauncher::with_read_chunk_size(4)
            .launch(&sh("printf 0123456789"), events)
            .unwrap();

        let events = collect(rx).await;
        let mut total = 0;
        for event in &events {
            if let ProcessEvent::Chunk(data) = event {
                assert!(!data.is_empty() && data.len() <= 4);
                total += data.len();
            }
        }
        assert_eq!(total, 10);
    }
}
