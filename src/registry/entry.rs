//! Session entry and subscriber types
//!
//! This module defines the per-session state stored in the registry.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::process::ProcessSupervisor;

use super::key::SessionKey;

/// Identity of one session instance
///
/// A key may be reused by a later session after teardown; the id never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one subscriber connection
pub type SubscriberId = u64;

/// Message queued for a subscriber connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One transcoder output chunk, sent as one binary message
    Chunk(Bytes),
    /// Close the connection
    Close,
}

/// Why a chunk could not be queued for a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber's queue is full
    Lagging,
    /// The connection is already gone
    Disconnected,
}

/// Registry-side handle to one downstream connection
///
/// Sending never blocks. Dropping the handle ends the connection's queue.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Outbound>,
}

impl Subscriber {
    /// Create a handle delivering into `tx`
    pub fn new(id: SubscriberId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Subscriber id
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a chunk for delivery
    pub fn send(&self, chunk: Bytes) -> Result<(), DeliveryError> {
        self.tx.try_send(Outbound::Chunk(chunk)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Disconnected,
        })
    }

    /// Close the connection
    ///
    /// If the queue is full the close message is dropped, but dropping the
    /// handle still ends the connection once the queue drains.
    pub fn close(self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

/// Entry for a single session in the registry
pub struct Session {
    /// Session identity
    pub id: SessionId,

    /// Session key
    pub key: SessionKey,

    /// Supervisor of the session's transcoder
    pub supervisor: ProcessSupervisor,

    /// Current subscribers, in arrival order
    pub(super) subscribers: Vec<Subscriber>,

    /// When the session was created
    pub created_at: Instant,

    /// Chunks broadcast so far
    pub chunks_sent: u64,

    /// Payload bytes broadcast so far
    pub bytes_sent: u64,
}

impl Session {
    /// Create a new session with a first subscriber
    pub(super) fn new(
        id: SessionId,
        key: SessionKey,
        supervisor: ProcessSupervisor,
        first: Subscriber,
    ) -> Self {
        Self {
            id,
            key,
            supervisor,
            subscribers: vec![first],
            created_at: Instant::now(),
            chunks_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Get the number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Add a subscriber; a handle whose id is already present replaces it
    pub(super) fn add_subscriber(&mut self, subscriber: Subscriber) {
        match self.subscribers.iter_mut().find(|s| s.id() == subscriber.id()) {
            Some(existing) => *existing = subscriber,
            None => self.subscribers.push(subscriber),
        }
    }

    /// Remove a subscriber, returning its handle
    pub(super) fn remove_subscriber(&mut self, id: SubscriberId) -> Option<Subscriber> {
        let index = self.subscribers.iter().position(|s| s.id() == id)?;
        Some(self.subscribers.remove(index))
    }

    /// Send a chunk to every current subscriber
    ///
    /// Subscribers that lag or are gone are removed and returned alongside
    /// the reason.
    pub(super) fn broadcast(&mut self, chunk: &Bytes) -> Vec<(Subscriber, DeliveryError)> {
        self.chunks_sent += 1;
        self.bytes_sent += chunk.len() as u64;

        let mut failed = Vec::new();
        let mut kept = Vec::with_capacity(self.subscribers.len());

        for subscriber in self.subscribers.drain(..) {
            match subscriber.send(chunk.clone()) {
                Ok(()) => kept.push(subscriber),
                Err(reason) => failed.push((subscriber, reason)),
            }
        }

        self.subscribers = kept;
        failed
    }

    /// Take every subscriber out of the set
    pub(super) fn drain_subscribers(&mut self) -> Vec<Subscriber> {
        std::mem::take(&mut self.subscribers)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("subscribers", &self.subscribers.len())
            .field("state", &self.supervisor.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_delivery() {
        let (tx, mut rx) = mpsc::channel(1);
        let subscriber = Subscriber::new(1, tx);

        subscriber.send(Bytes::from_static(b"a")).unwrap();
        assert_eq!(subscriber.send(Bytes::from_static(b"b")), Err(DeliveryError::Lagging));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Chunk(Bytes::from_static(b"a")));

        drop(rx);
        assert_eq!(
            subscriber.send(Bytes::from_static(b"c")),
            Err(DeliveryError::Disconnected)
        );
    }

    #[test]
    fn test_close_sends_close_message() {
        let (tx, mut rx) = mpsc::channel(4);
        Subscriber::new(1, tx).close();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        // Handle dropped, channel closed
        assert!(rx.try_recv().is_err());
    }
}
