use super::AppState;
use crate::models::StatusChange;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let changes = state.payments.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, changes))
}

/// Streams every committed status change to the client as JSON.
async fn handle_socket(socket: WebSocket, mut changes: broadcast::Receiver<StatusChange>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Ok(msg) = serde_json::to_string(&change) {
                        if sender.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("WebSocket client lagged, {} status changes skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("WebSocket connection closed");
}
