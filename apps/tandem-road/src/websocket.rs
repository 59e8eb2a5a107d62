use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tandem_proto::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::registry::ParticipantId;
use crate::signaling::HubHandle;

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(hub): State<HubHandle>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Pumps one websocket: frames in become hub commands, hub events out become
/// text frames. A closed socket is reported to the hub as a disconnect.
async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let participant = ParticipantId::new();
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this participant
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    if hub.connect(participant, tx.clone()).await.is_err() {
        error!("Signaling hub unavailable; dropping connection");
        return;
    }

    // Spawn task to forward events from the channel to the websocket
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode server event: {}", e),
            }
        }
        debug!("Event sender task ended for participant {}", participant);
    });

    debug!("WebSocket connected: participant={}", participant);

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!("WebSocket error from participant {}: {}", participant, e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            // Also accept JSON carried in binary frames
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring non-UTF8 binary frame from {}", participant);
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => {
                if hub.dispatch(participant, event).await.is_err() {
                    error!("Signaling hub stopped while handling {}", participant);
                    break;
                }
            }
            Err(e) => {
                warn!("Invalid event from participant {}: {}", participant, e);
                let _ = tx.send(ServerEvent::Error {
                    message: format!("Invalid event format: {}", e),
                });
            }
        }
    }

    // The writer task ends once the hub drops its copy of the sender.
    drop(tx);
    let _ = hub.disconnect(participant).await;
    debug!("WebSocket disconnected: participant={}", participant);
}
