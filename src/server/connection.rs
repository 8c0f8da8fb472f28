//! Subscriber connection handling
//!
//! Each accepted WebSocket runs [`serve_subscriber`]: it registers a
//! [`Subscriber`] with the gateway, then forwards queued chunks as binary
//! messages until either side closes.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::registry::{Outbound, RequestParams, SessionKey, Subscriber, SubscriberId};

use super::gateway::GatewayHandle;

/// Run one subscriber connection to completion
///
/// The gateway is always told about the disconnect, so the registry stops
/// delivering to this connection once the returned future completes.
pub async fn serve_subscriber(
    socket: WebSocket,
    gateway: GatewayHandle,
    id: SubscriberId,
    key: SessionKey,
    params: RequestParams,
    send_queue: usize,
) {
    let (tx, mut rx) = mpsc::channel(send_queue.max(1));

    if gateway
        .subscribe(key.clone(), params, Subscriber::new(id, tx))
        .await
        .is_err()
    {
        tracing::debug!(subscriber = id, "Gateway closed, dropping connection");
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Chunk(data)) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        tracing::debug!(subscriber = id, error = %e, "Send failed");
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber = id, error = %e, "Receive failed");
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
    let _ = gateway.unsubscribe(key.clone(), id).await;

    tracing::debug!(session = %key, subscriber = id, "Subscriber disconnected");
}
