//! Session registry implementation
//!
//! The central registry that maps session keys to transcoder sessions and
//! fans process output out to subscribers. It is owned by a single control
//! task and mutated through `&mut self`, so no locking is involved.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::process::{
    EventSink, ExitKind, Launcher, ProcessEvent, ProcessExit, ProcessNotification,
    ProcessSupervisor, TranscoderConfig,
};
use crate::stats::{ServerStats, SessionStats, StatsSnapshot};

use super::config::RegistryConfig;
use super::entry::{DeliveryError, Session, SessionId, Subscriber, SubscriberId};
use super::error::RequestError;
use super::key::{RequestParams, SessionKey};
use super::reaper::IdleReaper;

/// Why a session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The transcoder wrote to stderr
    UpstreamError,
    /// The transcoder exited
    UpstreamExit,
    /// The transcoder could not be started
    SpawnFailed,
    /// No subscribers for the idle timeout
    Idle,
    /// The gateway is shutting down
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownReason::UpstreamError => "upstream_error",
            TeardownReason::UpstreamExit => "upstream_exit",
            TeardownReason::SpawnFailed => "spawn_failed",
            TeardownReason::Idle => "idle",
            TeardownReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Result of a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Joined an existing session
    Joined(SessionId),
    /// Created a new session and started its transcoder
    Created(SessionId),
    /// Request rejected; no session was created
    Rejected(RequestError),
    /// The transcoder could not be started; the session was torn down
    SpawnFailed,
}

/// Central registry for all live sessions
pub struct SessionRegistry {
    /// Map of session key to session
    sessions: HashMap<SessionKey, Session>,

    /// Idle bookkeeping
    reaper: IdleReaper,

    /// Process launching capability
    launcher: Arc<dyn Launcher>,

    /// Transcoder invocation settings
    transcoder: TranscoderConfig,

    /// Sender cloned into every process event sink
    events: mpsc::UnboundedSender<ProcessNotification>,

    next_session_id: u64,

    stats: ServerStats,

    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry
    ///
    /// Process notifications for every session are delivered to `events`;
    /// the owner must feed them back through [`SessionRegistry::handle_notification`].
    pub fn new(
        config: RegistryConfig,
        transcoder: TranscoderConfig,
        launcher: Arc<dyn Launcher>,
        events: mpsc::UnboundedSender<ProcessNotification>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            reaper: IdleReaper::new(&config),
            launcher,
            transcoder,
            events,
            next_session_id: 1,
            stats: ServerStats::new(),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add a subscriber to the session for `key`, creating it if needed
    ///
    /// Creating a session requires a decodable locator parameter. A missing
    /// locator closes the subscriber; an undecodable one drops it without a
    /// close message.
    pub fn subscribe(
        &mut self,
        key: SessionKey,
        subscriber: Subscriber,
        params: &RequestParams,
    ) -> SubscribeOutcome {
        if let Some(session) = self.sessions.get_mut(&key) {
            session.add_subscriber(subscriber);
            self.stats.subscribers_accepted += 1;

            tracing::debug!(
                session = %key,
                session_id = %session.id,
                subscribers = session.subscriber_count(),
                "Subscriber added"
            );

            return SubscribeOutcome::Joined(session.id);
        }

        let locator = match params.locator() {
            Ok(locator) => locator,
            Err(e) => {
                self.stats.requests_rejected += 1;
                match e {
                    RequestError::MissingLocator => {
                        tracing::debug!(session = %key, "Request without locator, closing");
                        subscriber.close();
                    }
                    RequestError::LocatorDecode(ref reason) => {
                        tracing::warn!(session = %key, reason = %reason, "Locator decode failed");
                        drop(subscriber);
                    }
                }
                return SubscribeOutcome::Rejected(e);
            }
        };

        let id = SessionId::new(self.next_session_id);
        self.next_session_id += 1;

        let supervisor = ProcessSupervisor::new(id, &self.transcoder, &locator, params);
        let session = Session::new(id, key.clone(), supervisor, subscriber);

        self.sessions.insert(key.clone(), session);
        self.reaper.track(key.clone());
        self.stats.sessions_created += 1;
        self.stats.subscribers_accepted += 1;

        tracing::info!(session = %key, session_id = %id, "Session created");

        let sink = EventSink::new(key.clone(), id, self.events.clone());
        let opened = match self.sessions.get_mut(&key) {
            Some(session) => session.supervisor.open(self.launcher.as_ref(), sink),
            None => return SubscribeOutcome::SpawnFailed,
        };

        match opened {
            Ok(()) => SubscribeOutcome::Created(id),
            Err(e) => {
                tracing::warn!(session = %key, session_id = %id, error = %e, "Transcoder spawn failed");
                self.teardown(&key, TeardownReason::SpawnFailed);
                SubscribeOutcome::SpawnFailed
            }
        }
    }

    /// Remove a subscriber from the session for `key`
    ///
    /// The session itself survives with zero subscribers until it is reaped
    /// or its process ends. Returns whether the subscriber was present.
    pub fn unsubscribe(&mut self, key: &SessionKey, subscriber: SubscriberId) -> bool {
        let Some(session) = self.sessions.get_mut(key) else {
            return false;
        };

        let removed = session.remove_subscriber(subscriber).is_some();
        if removed {
            tracing::debug!(
                session = %key,
                subscriber = subscriber,
                subscribers = session.subscriber_count(),
                "Subscriber removed"
            );
        }
        removed
    }

    /// Apply a notification from a session's process
    ///
    /// Notifications from a session that is no longer live are ignored.
    pub fn handle_notification(&mut self, notification: ProcessNotification) {
        let ProcessNotification {
            key,
            session: session_id,
            event,
        } = notification;

        match self.sessions.get(&key) {
            Some(session) if session.id == session_id => {}
            _ => {
                tracing::trace!(session = %key, session_id = %session_id, "Stale process notification");
                return;
            }
        }

        match event {
            ProcessEvent::Chunk(chunk) => self.broadcast(&key, chunk),
            ProcessEvent::Stderr(_) => {
                self.teardown(&key, TeardownReason::UpstreamError);
            }
            ProcessEvent::Exited(exit) => self.on_exit(&key, exit),
        }
    }

    fn on_exit(&mut self, key: &SessionKey, exit: ProcessExit) {
        if let Some(session) = self.sessions.get_mut(key) {
            match session.supervisor.record_exit(exit) {
                ExitKind::Voluntary => {
                    tracing::info!(session = %key, code = ?exit.code, "Transcoder stopped");
                }
                ExitKind::Abnormal => {
                    tracing::warn!(session = %key, code = ?exit.code, "Transcoder exited unexpectedly");
                }
            }
        }
        self.teardown(key, TeardownReason::UpstreamExit);
    }

    /// Send a chunk to every current subscriber of `key`
    fn broadcast(&mut self, key: &SessionKey, chunk: Bytes) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };

        for (subscriber, reason) in session.broadcast(&chunk) {
            match reason {
                DeliveryError::Lagging => {
                    tracing::warn!(
                        session = %key,
                        subscriber = subscriber.id(),
                        "Subscriber lagging, disconnecting"
                    );
                    subscriber.close();
                }
                DeliveryError::Disconnected => {
                    tracing::debug!(session = %key, subscriber = subscriber.id(), "Subscriber gone");
                }
            }
        }
    }

    /// Tear down the session for `key`
    ///
    /// Closes every subscriber, terminates the process and forgets the
    /// session. Returns false (and does nothing) if no session is live.
    pub fn teardown(&mut self, key: &SessionKey, reason: TeardownReason) -> bool {
        let Some(mut session) = self.sessions.remove(key) else {
            return false;
        };
        self.reaper.untrack(key);

        let subscribers = session.drain_subscribers();
        let closed = subscribers.len();
        for subscriber in subscribers {
            subscriber.close();
        }
        session.supervisor.close();
        self.stats.record_teardown(reason);

        tracing::info!(
            session = %key,
            session_id = %session.id,
            reason = %reason,
            subscribers_closed = closed,
            chunks = session.chunks_sent,
            "Session torn down"
        );

        true
    }

    /// Run one idle scan, tearing down expired sessions
    ///
    /// Returns the number of sessions torn down.
    pub fn reap_idle(&mut self) -> usize {
        let sessions = &self.sessions;
        let expired = self
            .reaper
            .scan(|key| sessions.get(key).map(Session::subscriber_count));

        let mut reaped = 0;
        for key in expired {
            if self.teardown(&key, TeardownReason::Idle) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Tear down every session
    pub fn shutdown(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            self.teardown(&key, TeardownReason::Shutdown);
        }
    }

    /// Check whether a live session exists for `key`
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Get the live session for `key`
    pub fn session(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    /// Get total number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of subscribers of the session for `key`
    pub fn subscriber_count(&self, key: &SessionKey) -> Option<usize> {
        self.sessions.get(key).map(Session::subscriber_count)
    }

    /// Accumulated idle time of the session for `key`
    pub fn idle_elapsed(&self, key: &SessionKey) -> Option<std::time::Duration> {
        self.reaper.idle_elapsed(key)
    }

    /// Get statistics for one session
    pub fn session_stats(&self, key: &SessionKey) -> Option<SessionStats> {
        self.sessions
            .get(key)
            .map(|session| SessionStats::from_session(session, self.reaper.idle_elapsed(key)))
    }

    /// Snapshot of server-wide and per-session statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut server = self.stats.clone();
        server.active_sessions = self.sessions.len() as u64;
        server.active_subscribers = self
            .sessions
            .values()
            .map(|s| s.subscriber_count() as u64)
            .sum();

        let mut sessions: Vec<SessionStats> = self
            .sessions
            .iter()
            .map(|(key, session)| SessionStats::from_session(session, self.reaper.idle_elapsed(key)))
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));

        StatsSnapshot { server, sessions }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}
