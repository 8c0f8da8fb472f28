//! Transcoder processes
//!
//! This module provides:
//! - A narrow launch/terminate capability ([`Launcher`], [`ProcessHandle`])
//! - A `tokio::process` implementation of it
//! - [`ProcessSupervisor`], which owns one process per session

pub mod launcher;
pub mod supervisor;

pub use launcher::{
    CommandLine, EventSink, Launcher, ProcessEvent, ProcessExit, ProcessHandle,
    ProcessNotification, SpawnError, TokioLauncher, DEFAULT_READ_CHUNK_SIZE,
};
pub use supervisor::{ExitKind, ProcessState, ProcessSupervisor, TranscoderConfig, TransportMode};
