//! WebSocket transport for signaling.
//!
//! One task per connection selects between client frames and room events.
//! Replies and pushes share the same sink, so they reach the client in the
//! order the task produced them.

use super::dispatcher::SignalingDispatcher;
use super::protocol::Response;
use super::session::Session;

use crate::errors::SignalingError;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest accepted signaling frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// `GET /ws` - upgrade to a signaling connection.
pub async fn ws_handler(
    State(dispatcher): State<Arc<SignalingDispatcher>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(socket: WebSocket, dispatcher: Arc<SignalingDispatcher>) {
    let (mut sink, mut stream) = socket.split();
    let (mut session, mut events) = Session::new();

    info!(
        target: "sfu.signaling",
        peer_id = %session.peer_id(),
        "Signaling connection opened"
    );

    loop {
        tokio::select! {
            frame = stream.next() => {
                let response = match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher.handle_frame(&mut session, &text).await
                    }
                    Some(Ok(Message::Binary(_))) => Response::error(
                        0,
                        &SignalingError::InvalidRequest("Binary frames are not supported".to_string()),
                    ),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.signaling",
                            peer_id = %session.peer_id(),
                            error = %e,
                            "WebSocket receive failed"
                        );
                        break;
                    }
                };

                if !send_json(&mut sink, &response).await {
                    break;
                }
            }

            Some(event) = events.recv() => {
                dispatcher.on_event(&mut session, &event);
                if !send_json(&mut sink, &event).await {
                    break;
                }
            }
        }
    }

    dispatcher.disconnect(&mut session).await;

    info!(
        target: "sfu.signaling",
        peer_id = %session.peer_id(),
        "Signaling connection closed"
    );
}

/// Serialize and send one frame. Returns false once the connection is unusable.
async fn send_json<T: Serialize>(sink: &mut SplitSink<WebSocket, Message>, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "sfu.signaling", error = %e, "Failed to serialize outbound frame");
            return true;
        }
    };

    match sink.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!(target: "sfu.signaling", error = %e, "WebSocket send failed");
            false
        }
    }
}
