//! WebSocket feed for dashboard clients.
//!
//! Per connection the client first receives one full snapshot
//! (`{device_id: sample, ...}`), then one message per delta: `{device_id:
//! sample}` for an update, `{device_id: null}` for a pruned device. Snapshot
//! and deltas together are everything a client needs to mirror the bridge's
//! state; there is no history to re-request.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeEvent, BridgeHandle};

/// Spawn the WebSocket server, returning the bound address.
pub async fn spawn_ws_server(
    bind_addr: SocketAddr,
    bridge: BridgeHandle,
) -> anyhow::Result<SocketAddr> {
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::trace::TraceLayer;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(bridge)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("WebSocket feed listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("WebSocket server error: {e}");
        }
    });

    Ok(addr)
}

/// WebSocket upgrade handler
///
/// GET /ws
async fn websocket_handler(ws: WebSocketUpgrade, State(bridge): State<BridgeHandle>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, bridge))
}

async fn handle_websocket(socket: WebSocket, bridge: BridgeHandle) {
    info!("WebSocket client connected");

    // Subscription and snapshot are taken atomically by the bridge actor, so
    // the delta stream continues exactly where the snapshot ends.
    let Ok(subscription) = bridge.subscribe().await else {
        debug!("bridge unavailable, dropping client");
        return;
    };

    let (mut sender, mut receiver) = socket.split();

    let snapshot = match serde_json::to_string(&subscription.snapshot) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to serialize snapshot: {e}");
            return;
        }
    };
    if sender.send(Message::Text(snapshot)).await.is_err() {
        debug!("WebSocket send failed, client disconnected");
        return;
    }

    let mut events = subscription.events;

    // Forward deltas until the client goes away or falls too far behind.
    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let text = delta_json(&event);
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // a client this slow would render stale state forever;
                    // cut it loose and let it reconnect for a fresh snapshot
                    warn!("subscriber lagged by {skipped} events, disconnecting");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("bridge event channel closed");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
            // the feed is one-way; everything else is ignored
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}

/// Wire encoding of one delta message.
fn delta_json(event: &BridgeEvent) -> String {
    let value = match event {
        BridgeEvent::Update { sample } => json!({ &sample.device_id: sample }),
        BridgeEvent::Removed { device_id } => json!({ device_id: null }),
    };
    value.to_string()
}
