//! Agent connection registry and envelope routing
//!
//! Registration happens on the first `CONNECTED` announcement; liveness is
//! a PING broadcast every ping interval with eviction after the configured
//! timeout (roughly three missed cycles at the defaults). All failures are
//! scoped to a single message or a single client.

use crate::config::IpcConfig;
use crate::ipc::protocol::{
    AddonResponseData, ClientRequestType, ClientResponseType, ConnectedData, Envelope,
    MessageType, PublishMessageData, ServerRequestType,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Events the channel hands to the service for routing
#[derive(Debug)]
pub enum AgentEvent {
    /// An agent replied to an addon request
    AddonResponse {
        username: String,
        addon_id: String,
        data: serde_json::Value,
    },
    /// An agent asked for a broker publish (bypasses the addon registry)
    PublishRequested { topic: String, payload: String },
}

struct ClientHandle {
    username: String,
    last_ack: Instant,
    sender: mpsc::UnboundedSender<String>,
}

/// Registry + router for agent WebSocket connections.
pub struct AgentChannel {
    config: IpcConfig,
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    event_tx: mpsc::Sender<AgentEvent>,
    stopped: AtomicBool,
}

fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl AgentChannel {
    pub fn new(config: IpcConfig, event_tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            event_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether a client is registered under this username.
    pub async fn is_registered(&self, username: &str) -> bool {
        let wanted = normalize_username(username);
        self.clients
            .read()
            .await
            .values()
            .any(|c| c.username == wanted)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handle one text frame from a connection. Malformed envelopes are
    /// trace-logged and dropped; nothing here returns an error.
    pub async fn handle_message(
        &self,
        connection_id: Uuid,
        sender: &mpsc::UnboundedSender<String>,
        text: &str,
    ) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::trace!(%connection_id, "Malformed envelope dropped: {}", e);
                return;
            }
        };

        match envelope.message_type {
            MessageType::ClientRequest => {
                self.handle_client_request(connection_id, sender, envelope.content.kind, envelope.content.data)
                    .await;
            }
            MessageType::ClientResponse => {
                self.handle_client_response(connection_id, envelope.content.kind, envelope.content.data)
                    .await;
            }
            MessageType::ApiMessage => {
                tracing::debug!(%connection_id, data = ?envelope.content.data, "API message");
            }
            MessageType::ServerRequest | MessageType::ServerResponse => {
                tracing::trace!(
                    %connection_id,
                    "Server-directional envelope from client dropped"
                );
            }
        }
    }

    async fn handle_client_request(
        &self,
        connection_id: Uuid,
        sender: &mpsc::UnboundedSender<String>,
        kind: u8,
        data: Option<serde_json::Value>,
    ) {
        let kind = match ClientRequestType::try_from(kind) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::trace!(%connection_id, "{}", e);
                return;
            }
        };

        match kind {
            ClientRequestType::Connected => {
                let Some(data) = data else {
                    tracing::trace!(%connection_id, "CONNECTED without data dropped");
                    return;
                };
                let connected: ConnectedData = match serde_json::from_value(data) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::trace!(%connection_id, "Bad CONNECTED payload: {}", e);
                        return;
                    }
                };

                let mut clients = self.clients.write().await;
                if clients.contains_key(&connection_id) {
                    tracing::debug!(%connection_id, "Duplicate CONNECTED ignored");
                    return;
                }
                let username = normalize_username(&connected.username);
                tracing::info!(%connection_id, username = %username, "Agent registered");
                clients.insert(
                    connection_id,
                    ClientHandle {
                        username,
                        last_ack: Instant::now(),
                        sender: sender.clone(),
                    },
                );
            }
            // Accepted regardless of registration state.
            ClientRequestType::PublishMessage => {
                let Some(data) = data else {
                    tracing::trace!(%connection_id, "PUBLISH_MESSAGE without data dropped");
                    return;
                };
                let publish: PublishMessageData = match serde_json::from_value(data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::trace!(%connection_id, "Bad PUBLISH_MESSAGE payload: {}", e);
                        return;
                    }
                };
                let _ = self
                    .event_tx
                    .send(AgentEvent::PublishRequested {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                    .await;
            }
        }
    }

    async fn handle_client_response(
        &self,
        connection_id: Uuid,
        kind: u8,
        data: Option<serde_json::Value>,
    ) {
        let kind = match ClientResponseType::try_from(kind) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::trace!(%connection_id, "{}", e);
                return;
            }
        };

        match kind {
            ClientResponseType::Ping => {
                let mut clients = self.clients.write().await;
                if let Some(client) = clients.get_mut(&connection_id) {
                    client.last_ack = Instant::now();
                }
            }
            ClientResponseType::AddonResponse => {
                let username = {
                    let clients = self.clients.read().await;
                    clients.get(&connection_id).map(|c| c.username.clone())
                };
                let Some(username) = username else {
                    tracing::debug!(%connection_id, "ADDON_RESPONSE from unregistered client dropped");
                    return;
                };
                let Some(data) = data else {
                    tracing::trace!(%connection_id, "ADDON_RESPONSE without data dropped");
                    return;
                };
                let response: AddonResponseData = match serde_json::from_value(data) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::trace!(%connection_id, "Bad ADDON_RESPONSE payload: {}", e);
                        return;
                    }
                };
                let _ = self
                    .event_tx
                    .send(AgentEvent::AddonResponse {
                        username,
                        addon_id: response.addon_id,
                        data: response.data,
                    })
                    .await;
            }
        }
    }

    /// Transport closed a connection; drop its registration if any.
    pub async fn handle_disconnect(&self, connection_id: Uuid) {
        if let Some(client) = self.clients.write().await.remove(&connection_id) {
            tracing::info!(%connection_id, username = %client.username, "Agent unregistered");
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send a server request to one agent (by username) or all agents.
    /// A blank/absent username broadcasts. Unicast misses log a warning;
    /// a failed send force-closes and removes that client only.
    pub async fn send_request(
        &self,
        kind: ServerRequestType,
        data: Option<serde_json::Value>,
        username: Option<&str>,
    ) {
        let envelope = Envelope::server_request(kind, data);
        let json = match serde_json::to_string(&envelope) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!("Failed to encode server request: {}", e);
                return;
            }
        };

        let target = username.map(normalize_username).filter(|u| !u.is_empty());

        let recipients: Vec<(Uuid, mpsc::UnboundedSender<String>)> = {
            let clients = self.clients.read().await;
            match &target {
                Some(wanted) => clients
                    .iter()
                    .filter(|(_, c)| &c.username == wanted)
                    .map(|(id, c)| (*id, c.sender.clone()))
                    .collect(),
                None => clients
                    .iter()
                    .map(|(id, c)| (*id, c.sender.clone()))
                    .collect(),
            }
        };

        if recipients.is_empty() {
            if let Some(wanted) = target {
                tracing::warn!(username = %wanted, "No agent registered for unicast");
            }
            return;
        }

        let mut dead = Vec::new();
        for (id, sender) in recipients {
            if sender.send(json.clone()).is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                if let Some(client) = clients.remove(&id) {
                    tracing::warn!(
                        connection_id = %id,
                        username = %client.username,
                        "Send failed, client removed"
                    );
                }
            }
        }
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// One liveness pass: broadcast PING, then evict clients whose last
    /// ack is older than the timeout. Public so the loop and tests share
    /// the same code path.
    pub async fn liveness_pass(&self) {
        self.send_request(ServerRequestType::Ping, None, None).await;

        let timeout = Duration::from_secs(self.config.client_timeout_secs);
        let stale: Vec<Uuid> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, c)| c.last_ack.elapsed() >= timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        if stale.is_empty() {
            return;
        }

        // Removal drops the handle's sender, which closes the socket's
        // writer task; failures closing are not possible past this point.
        let mut clients = self.clients.write().await;
        for id in stale {
            if let Some(client) = clients.remove(&id) {
                tracing::warn!(
                    connection_id = %id,
                    username = %client.username,
                    "Agent evicted: no ack within {:?}",
                    timeout
                );
            }
        }
    }

    /// Periodic liveness loop; each pass runs to completion before the
    /// next is scheduled.
    pub fn start_liveness(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(channel.config.ping_interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                if channel.stopped.load(Ordering::SeqCst) {
                    break;
                }
                channel.liveness_pass().await;
            }
        })
    }

    /// Stop the liveness loop at its next wakeup.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
