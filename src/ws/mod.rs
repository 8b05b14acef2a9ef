pub mod admin;
pub mod handlers;
pub mod llm;

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::bearer_token;
use crate::state::{AppState, Outgoing};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.token.or_else(|| bearer_token(&headers));
    tracing::info!(
        "WebSocket connection request from {} (token: {})",
        addr,
        token.is_some()
    );

    ws.on_upgrade(move |socket| handle_socket(socket, addr, token, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    addr: SocketAddr,
    token: Option<String>,
    state: Arc<AppState>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

    // Writer: the only place frames are written to the socket
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let frame = match item {
                Outgoing::Message(msg) => match msg.to_json() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        tracing::error!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                },
                Outgoing::Ping => Message::Ping(Bytes::new()),
                Outgoing::Close { reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let connection = match state.connect(tx, Some(addr.ip()), token.as_deref()).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::info!("Connection from {} refused: {}", addr, e);
            let _ = writer.await;
            return;
        }
    };

    let closed = connection.closed();
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        state.router.handle_frame(&connection, text.as_str().as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.router.handle_frame(&connection, &data).await;
                    }
                    Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed by {}", connection.id);
                        break;
                    }
                    // Pings are answered by the websocket layer
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error on {}: {}", connection.id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.disconnect(&connection.id, "peer closed").await;
    let _ = writer.await;
    tracing::info!("WebSocket connection {} finished", connection.id);
}
