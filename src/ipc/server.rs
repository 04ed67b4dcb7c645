//! WebSocket endpoint for agent connections
//!
//! One route for agents (`/ws`) plus a `/health` probe. Each socket gets a
//! generated connection id and a writer task fed by an unbounded channel;
//! dropping the channel (eviction, send failure) closes the socket.

use crate::ipc::AgentChannel;
use crate::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Build the IPC router.
pub fn router(channel: Arc<AgentChannel>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(channel)
}

/// Bind the listener and serve the router on a background task.
/// Returns the bound address (useful when the port is 0).
pub async fn serve(
    channel: Arc<AgentChannel>,
    host: &str,
    port: u16,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    let addr = listener.local_addr()?;
    let app = router(channel);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("IPC server stopped: {}", e);
        }
    });

    tracing::info!(%addr, "Agent IPC endpoint listening");
    Ok((addr, handle))
}

async fn ws_upgrade(
    State(channel): State<Arc<AgentChannel>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, channel))
}

async fn handle_socket(socket: WebSocket, channel: Arc<AgentChannel>) {
    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut sink, mut stream) = socket.split();

    // Writer: drains outbound frames until the channel closes (normal
    // disconnect or eviction), then closes the socket.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tracing::debug!(%connection_id, "Agent connection opened");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                channel.handle_message(connection_id, &tx, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%connection_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    channel.handle_disconnect(connection_id).await;
    drop(tx);
    let _ = writer.await;
    tracing::debug!(%connection_id, "Agent connection closed");
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    agents: usize,
}

async fn health(State(channel): State<Arc<AgentChannel>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: channel.client_count().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::protocol::{Envelope, MessageType, ServerRequestType};
    use crate::ipc::AgentEvent;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn start_server() -> (
        Arc<AgentChannel>,
        mpsc::Receiver<AgentEvent>,
        SocketAddr,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let channel = Arc::new(AgentChannel::new(IpcConfig::default(), tx));
        let (addr, _handle) = serve(channel.clone(), "127.0.0.1", 0).await.unwrap();
        (channel, rx, addr)
    }

    async fn wait_for_registration(channel: &AgentChannel, username: &str) {
        for _ in 0..50 {
            if channel.is_registered(username).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agent '{}' never registered", username);
    }

    #[tokio::test]
    async fn test_agent_connect_register_unicast() {
        let (channel, _rx, addr) = start_server().await;

        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
                .await
                .unwrap();

        socket
            .send(WsMessage::Text(
                r#"{"messageType":0,"content":{"type":0,"data":{"username":"Alice"}}}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        wait_for_registration(&channel, "alice").await;

        channel
            .send_request(
                ServerRequestType::ShowMessage,
                Some(serde_json::json!({"title": "Hi", "message": "there"})),
                Some("alice"),
            )
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let envelope: Envelope = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(envelope.message_type, MessageType::ServerRequest);
        assert_eq!(envelope.content.kind, ServerRequestType::ShowMessage as u8);
    }

    #[tokio::test]
    async fn test_agent_publish_before_registration_forwarded() {
        let (_channel, mut rx, addr) = start_server().await;

        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
                .await
                .unwrap();

        socket
            .send(WsMessage::Text(
                r#"{"messageType":0,"content":{"type":1,"data":{"topic":"stats/cpu","payload":"42"}}}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            AgentEvent::PublishRequested { topic, payload } => {
                assert_eq!(topic, "stats/cpu");
                assert_eq!(payload, "42");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (channel, _rx, addr) = start_server().await;

        let (mut socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
                .await
                .unwrap();
        socket
            .send(WsMessage::Text(
                r#"{"messageType":0,"content":{"type":0,"data":{"username":"bob"}}}"#
                    .to_string(),
            ))
            .await
            .unwrap();
        wait_for_registration(&channel, "bob").await;

        socket.close(None).await.unwrap();

        for _ in 0..50 {
            if channel.client_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("client was not removed after disconnect");
    }
}
