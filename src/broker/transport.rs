//! Broker transport capability
//!
//! The bridge treats the broker protocol as opaque: it needs connect,
//! disconnect, publish, one subscribe, and a connectivity probe. Inbound
//! publishes and transport drops are delivered as [`TransportEvent`]s.

use crate::config::BrokerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Events surfaced by a transport implementation
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound publish matching the active subscription
    Message { topic: String, payload: Vec<u8> },
    /// The transport dropped outside an explicit disconnect
    ConnectionLost { reason: String },
}

/// Opaque broker transport consumed by the bridge
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the transport; resolves once the broker acknowledged the
    /// session or fails within the configured connect timeout.
    async fn connect(&self) -> Result<()>;

    /// Close the transport. Never fails; a dead transport is already closed.
    async fn disconnect(&self);

    /// Publish one message. At-most-once semantics.
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Whether the transport currently holds a live session.
    async fn is_connected(&self) -> bool;
}

/// MQTT transport over rumqttc's `AsyncClient` + background event loop.
pub struct RumqttcTransport {
    config: BrokerConfig,
    /// Client id fallback when the config leaves it unset
    default_client_id: String,
    /// Full last-will topic/payload/retain, when announcements are on
    last_will: Option<(String, String, bool)>,
    event_tx: mpsc::Sender<TransportEvent>,
    client: RwLock<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
}

impl RumqttcTransport {
    pub fn new(
        config: BrokerConfig,
        default_client_id: String,
        last_will: Option<(String, String, bool)>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            config,
            default_client_id,
            last_will,
            event_tx,
            client: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| self.default_client_id.clone());
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        if let Some((topic, payload, retain)) = &self.last_will {
            options.set_last_will(LastWill::new(
                topic.clone(),
                payload.clone().into_bytes(),
                QoS::AtMostOnce,
                *retain,
            ));
        }
        options
    }
}

#[async_trait]
impl BrokerTransport for RumqttcTransport {
    async fn connect(&self) -> Result<()> {
        let (client, mut event_loop) = AsyncClient::new(self.options(), 64);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let connected = self.connected.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let _ = event_tx
                            .send(TransportEvent::Message {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            })
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let was_connected = connected.swap(false, Ordering::SeqCst);
                        match ready.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(Error::Broker(e.to_string())));
                            }
                            None if was_connected => {
                                let _ = event_tx
                                    .send(TransportEvent::ConnectionLost {
                                        reason: e.to_string(),
                                    })
                                    .await;
                            }
                            None => {}
                        }
                        break;
                    }
                }
            }
        });

        *self.client.write().await = Some(client);

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let result = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Broker("connection task ended".to_string())),
            Err(_) => Err(Error::Broker(format!(
                "connect timed out after {:?}",
                timeout
            ))),
        };

        if result.is_err() {
            *self.client.write().await = None;
        }
        result
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let client = self.client.read().await.clone();
        let client = client.ok_or_else(|| Error::Broker("not connected".to_string()))?;
        client
            .publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        let client = self.client.read().await.clone();
        let client = client.ok_or_else(|| Error::Broker("not connected".to_string()))?;
        client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
