//! `/tracking` live channel
//!
//! One WebSocket per client. Clients subscribe and unsubscribe per venue;
//! each subscription gets its own hub queue (with the frame-drop policy) and
//! a pump task that feeds the shared socket writer. A malformed client
//! message closes the connection; other clients are unaffected.

use crate::domain::types::VenueId;
use crate::http::AppState;
use crate::services::fanout::ClientQueue;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "venueId")]
        venue_id: i64,
    },
    Unsubscribe {
        #[serde(rename = "venueId")]
        venue_id: i64,
    },
}

struct Subscription {
    queue: Arc<ClientQueue>,
    pump: JoinHandle<()>,
}

pub async fn tracking_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // All subscription pumps feed one writer so socket sends stay ordered
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<VenueId, Subscription> = HashMap::new();
    info!("tracking_client_connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { venue_id }) => {
                    let venue_id = VenueId(venue_id);
                    if subscriptions.contains_key(&venue_id) {
                        continue;
                    }
                    let access = state.engine.ensure_venue(venue_id);
                    let queue = access.hub.subscribe();
                    let pump = spawn_pump(queue.clone(), out_tx.clone());
                    subscriptions.insert(venue_id, Subscription { queue, pump });
                    debug!(venue_id = %venue_id, "tracking_subscribed");
                }
                Ok(ClientMessage::Unsubscribe { venue_id }) => {
                    let venue_id = VenueId(venue_id);
                    if let Some(subscription) = subscriptions.remove(&venue_id) {
                        subscription.queue.close();
                        debug!(venue_id = %venue_id, "tracking_unsubscribed");
                    }
                }
                Err(e) => {
                    // Protocol error: drop this client, leave the rest alone
                    warn!(error = %e, "tracking_bad_payload_closing");
                    break;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "tracking_socket_error");
                break;
            }
        }
    }

    for subscription in subscriptions.values() {
        subscription.queue.close();
        subscription.pump.abort();
    }
    writer.abort();
    info!("tracking_client_disconnected");
}

/// Forward one subscription's queue into the shared writer until it closes
fn spawn_pump(queue: Arc<ClientQueue>, out_tx: mpsc::Sender<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outbound) = queue.pop().await {
            let text = outbound.text.to_string();
            if out_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    })
}
