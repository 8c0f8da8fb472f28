use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtsp_ws_relay::{RelayServer, ServerConfig, TransportMode};

/// Relay upstream media sources to WebSocket subscribers through a transcoder
#[derive(Debug, Parser)]
#[command(name = "rtsp-ws-relay", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "RTSP_WS_RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "RTSP_WS_RELAY_PORT", default_value_t = 9999)]
    port: u16,

    /// Path subscribers connect to
    #[arg(long, env = "RTSP_WS_RELAY_PATH", default_value = "/proxy")]
    path: String,

    /// Transcoder executable
    #[arg(long, env = "RTSP_WS_RELAY_TRANSCODER_PATH", default_value = "ffmpeg")]
    transcoder_path: String,

    /// Seconds a session may have no subscribers before it is reaped
    #[arg(long, env = "RTSP_WS_RELAY_IDLE_TIMEOUT_SECONDS", default_value_t = 60)]
    idle_timeout_seconds: u64,

    /// Seconds between idle checks
    #[arg(long, env = "RTSP_WS_RELAY_CHECK_INTERVAL_SECONDS", default_value_t = 10)]
    check_interval_seconds: u64,

    /// How the transcoder reaches the upstream source
    #[arg(long, env = "RTSP_WS_RELAY_TRANSPORT_MODE", value_enum, default_value_t = TransportMode::Tcp)]
    transport_mode: TransportMode,

    /// Pass-through option clients may use (repeatable; default: any well-formed flag)
    #[arg(
        long = "allow-option",
        env = "RTSP_WS_RELAY_ALLOW_OPTIONS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    allowed_options: Vec<String>,

    /// Chunks queued per subscriber before it is dropped as lagging
    #[arg(long, env = "RTSP_WS_RELAY_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig::default()
            .bind((self.host, self.port).into())
            .path(self.path)
            .transcoder_path(self.transcoder_path)
            .transport_mode(self.transport_mode)
            .allowed_options(self.allowed_options)
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds))
            .check_interval(Duration::from_secs(self.check_interval_seconds))
            .send_queue(self.send_queue)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rtsp_ws_relay=info")),
        )
        .init();

    let config = Cli::parse().into_config();
    let server = RelayServer::new(config);

    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Relay server failed");
            ExitCode::FAILURE
        }
    }
}
