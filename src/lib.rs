//! WebSocket relay for transcoded media streams
//!
//! Subscribers connect over WebSocket with a query string naming an upstream
//! source (base64 in the `url` parameter) and optional transcoder flags.
//! Requests that normalize to the same session key share one transcoder
//! process; its stdout is fanned out to every subscriber as binary messages.
//! Sessions are torn down as soon as the transcoder fails or exits, and
//! reclaimed after their subscriber set has stayed empty for the idle
//! timeout.
//!
//! ```no_run
//! use std::time::Duration;
//! use rtsp_ws_relay::{RelayServer, ServerConfig};
//!
//! # async fn example() -> rtsp_ws_relay::Result<()> {
//! let config = ServerConfig::default()
//!     .port(9999)
//!     .path("/proxy")
//!     .idle_timeout(Duration::from_secs(60));
//!
//! RelayServer::new(config)
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! # }
//! ```

pub mod error;
pub mod process;
pub mod registry;
pub mod server;
pub mod stats;

pub use error::{Error, Result};
pub use process::{Launcher, TokioLauncher, TransportMode};
pub use registry::{RegistryConfig, RequestParams, SessionKey, SessionRegistry};
pub use server::{RelayServer, ServerConfig};
