//! Relay server listener
//!
//! Serves the subscriber WebSocket endpoint and the stats endpoint, and
//! runs the gateway task for the lifetime of the server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::error::Result;
use crate::process::{Launcher, TokioLauncher};
use crate::registry::{RequestParams, SessionKey};
use crate::server::config::{ServerConfig, STATS_PATH};
use crate::server::connection::serve_subscriber;
use crate::server::gateway::{Gateway, GatewayHandle};

/// Shared state passed to axum handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayHandle,
    next_subscriber_id: Arc<AtomicU64>,
    send_queue: usize,
}

/// WebSocket relay server
pub struct RelayServer {
    config: ServerConfig,
    launcher: Arc<dyn Launcher>,
}

impl RelayServer {
    /// Create a server that spawns transcoders with `tokio::process`
    pub fn new(config: ServerConfig) -> Self {
        let launcher = TokioLauncher::with_read_chunk_size(config.read_chunk_size);
        Self::with_launcher(config, Arc::new(launcher))
    }

    /// Create a server with a custom launcher
    pub fn with_launcher(config: ServerConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self { config, launcher }
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    ///
    /// When `shutdown` resolves, every session is torn down before the
    /// listener stops.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        let local_addr = listener.local_addr()?;

        let (gateway, gateway_task) = Gateway::spawn(
            self.config.registry.clone(),
            self.config.transcoder.clone(),
            Arc::clone(&self.launcher),
            self.config.command_queue,
        )?;

        let router = self.router(gateway.clone());

        tracing::info!(
            addr = %local_addr,
            path = %self.config.path,
            transcoder = %self.config.transcoder.program,
            transport = %self.config.transcoder.transport_mode,
            "Relay server listening"
        );

        let stop_gateway = gateway.clone();
        let signal = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received");
            let _ = stop_gateway.shutdown().await;
        };

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await;

        // The listener may also stop on its own; make sure sessions go too
        let _ = gateway.shutdown().await;
        let _ = gateway_task.await;

        result.map_err(Into::into)
    }

    fn router(&self, gateway: GatewayHandle) -> Router {
        let state = AppState {
            gateway,
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
            send_queue: self.config.send_queue,
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route(STATS_PATH, get(stats_handler))
            .with_state(state)
    }
}

/// WebSocket upgrade handler for subscribers
async fn ws_handler(ws: WebSocketUpgrade, uri: Uri, State(state): State<AppState>) -> Response {
    let params = RequestParams::from_query(uri.query().unwrap_or_default());
    let key = SessionKey::derive(uri.path(), &params);
    let id = state.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

    tracing::debug!(session = %key, subscriber = id, "New subscriber connection");

    ws.on_upgrade(move |socket| {
        serve_subscriber(socket, state.gateway, id, key, params, state.send_queue)
    })
}

/// Statistics endpoint
async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.gateway.stats().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
