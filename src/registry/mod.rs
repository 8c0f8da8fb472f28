//! Session registry for request multiplexing
//!
//! The registry maps each canonical session key to one transcoder process and
//! fans that process's output out to every subscriber of the key.
//!
//! # Architecture
//!
//! ```text
//!                          SessionRegistry (owned by the gateway task)
//!                     ┌─────────────────────────────┐
//!                     │ sessions: HashMap<Key,      │
//!                     │   Session {                 │
//!                     │     supervisor,             │
//!                     │     subscribers: Vec<Sub>,  │
//!                     │   }                         │
//!                     │ >                           │
//!                     │ reaper: idle time per key   │
//!                     └──────────────┬──────────────┘
//!                                    │
//!         ┌──────────────────────────┼──────────────────────────┐
//!         │                          │                          │
//!         ▼                          ▼                          ▼
//!    [Transcoder]              [Subscriber]               [Subscriber]
//!    stdout chunk              outbound queue             outbound queue
//!         │                          │                          │
//!         └──► handle_notification() ─► broadcast() ──► WebSocket frame
//! ```
//!
//! Chunks are `bytes::Bytes`, so every subscriber queue shares the same
//! allocation.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod reaper;
pub mod store;

pub use config::RegistryConfig;
pub use entry::{DeliveryError, Outbound, Session, SessionId, Subscriber, SubscriberId};
pub use error::RequestError;
pub use key::{decode_locator, RequestParams, SessionKey, LOCATOR_PARAM};
pub use reaper::IdleReaper;
pub use store::{SessionRegistry, SubscribeOutcome, TeardownReason};
