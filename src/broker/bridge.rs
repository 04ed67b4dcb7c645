//! Broker-bridge connection state machine
//!
//! One instance per process. Drives the transport through
//! Disconnected → Connecting → Connected, retries with a capped linear
//! backoff, keeps the session alive with a rate-limited watchdog, and
//! funnels all machine-scoped inbound traffic into a single event stream
//! consumed by the service's routing pump.

use crate::addons::Payload;
use crate::broker::{BrokerTransport, TransportEvent};
use crate::config::BrokerConfig;
use crate::topic::{machine_topic, sanitize};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events the bridge hands to the service for routing
#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    /// Inbound message, topic already stripped of `prefix/machine/`
    Message { topic: String, payload: Payload },
}

/// Retry delay for the given 1-based attempt: `min(base * attempt, cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.checked_mul(attempt).map_or(cap, |d| d.min(cap))
}

/// Bridge identity published alongside the connected announcement
#[derive(Debug, Serialize)]
struct BridgeInfo {
    machine: String,
    version: String,
    connected_at: chrono::DateTime<chrono::Utc>,
}

/// Reconnecting client to the external pub/sub broker.
pub struct BrokerBridge {
    config: BrokerConfig,
    prefix: String,
    machine: String,
    transport: Arc<dyn BrokerTransport>,
    state: RwLock<ConnectionState>,
    attempt_count: AtomicU32,
    /// Guard: only one connect loop runs at a time
    connecting: AtomicBool,
    /// Set by explicit disconnect; suppresses auto-reconnect
    manual_disconnect: AtomicBool,
    stopped: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
    event_tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerBridge {
    pub fn new(
        config: BrokerConfig,
        prefix: String,
        machine: String,
        transport: Arc<dyn BrokerTransport>,
        event_tx: mpsc::Sender<BrokerEvent>,
    ) -> Self {
        Self {
            config,
            prefix,
            machine,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            attempt_count: AtomicU32::new(0),
            connecting: AtomicBool::new(false),
            manual_disconnect: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            event_tx,
        }
    }

    /// Current state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Failed attempts since the last successful connect.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }

    /// Sanitized `prefix/machine` namespace owned by this bridge.
    pub fn machine_base(&self) -> String {
        sanitize(&format!("{}/{}", self.prefix, self.machine))
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Start the connect loop on its own task. A second call while a loop
    /// is in flight is a no-op.
    pub async fn connect(self: &Arc<Self>) {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Broker connect already in flight");
            return;
        }

        self.manual_disconnect.store(false, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connecting;

        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            bridge.run_connect_loop().await;
        });
    }

    /// Unbounded retry loop; exits on success or explicit stop.
    async fn run_connect_loop(&self) {
        loop {
            if self.stopped.load(Ordering::SeqCst) || self.manual_disconnect.load(Ordering::SeqCst)
            {
                *self.state.write().await = ConnectionState::Disconnected;
                break;
            }

            match self.transport.connect().await {
                Ok(()) => {
                    self.attempt_count.store(0, Ordering::SeqCst);
                    *self.state.write().await = ConnectionState::Connected;
                    self.on_connected().await;
                    break;
                }
                Err(e) => {
                    let attempt = self.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = backoff_delay(
                        attempt,
                        Duration::from_secs(self.config.backoff_base_secs),
                        Duration::from_secs(self.config.backoff_cap_secs),
                    );
                    tracing::warn!(
                        attempt,
                        "Broker connect failed: {}; retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.connecting.store(false, Ordering::SeqCst);
    }

    async fn on_connected(&self) {
        tracing::info!(namespace = %self.machine_base(), "Broker connected");

        // One machine-scoped wildcard; all inbound traffic funnels through it.
        let filter = format!("{}/#", self.machine_base());
        if let Err(e) = self.transport.subscribe(&filter).await {
            tracing::warn!(filter = %filter, "Wildcard subscribe failed: {}", e);
        }

        if let Some(announce) = &self.config.announce {
            let topic = machine_topic(&self.prefix, &self.machine, &announce.topic);
            if let Err(e) = self
                .transport
                .publish(
                    &topic,
                    announce.connected_payload.as_bytes(),
                    announce.retain,
                )
                .await
            {
                tracing::warn!("Connected announcement failed: {}", e);
            }

            let info = BridgeInfo {
                machine: self.machine_base(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                connected_at: chrono::Utc::now(),
            };
            if let Ok(payload) = serde_json::to_vec(&info) {
                let topic = machine_topic(&self.prefix, &self.machine, "bridge/info");
                if let Err(e) = self.transport.publish(&topic, &payload, announce.retain).await {
                    tracing::debug!("Bridge info publish failed: {}", e);
                }
            }
        }

        let _ = self.event_tx.send(BrokerEvent::Connected).await;
    }

    /// Explicit disconnect: suppresses auto-reconnect, optionally
    /// publishes the disconnected announcement, closes the transport.
    pub async fn disconnect(&self, announce: bool) {
        self.manual_disconnect.store(true, Ordering::SeqCst);

        if announce {
            if let Some(config) = &self.config.announce {
                let topic = machine_topic(&self.prefix, &self.machine, &config.topic);
                if let Err(e) = self
                    .transport
                    .publish(
                        &topic,
                        config.disconnected_payload.as_bytes(),
                        config.retain,
                    )
                    .await
                {
                    tracing::debug!("Disconnected announcement failed: {}", e);
                }
            }
        }

        self.transport.disconnect().await;
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(BrokerEvent::Disconnected).await;
        tracing::info!("Broker disconnected");
    }

    /// Stop for good: no reconnects after this.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.disconnect(true).await;
    }

    /// Tear the transport down without an announcement and start a fresh
    /// connect loop. Used by the watchdog and failed publishes.
    async fn force_reconnect(self: &Arc<Self>) {
        tracing::warn!("Forcing broker reconnect");
        self.transport.disconnect().await;
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(BrokerEvent::Disconnected).await;
        self.connect().await;
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Probe the transport and force a reconnect when it is silently dead.
    /// Rate-limited: bursts of calls (e.g. from failed publishes) probe at
    /// most once per `probe_min_interval_secs`.
    pub async fn verify_connection(self: &Arc<Self>) {
        {
            let mut last = self.last_probe.lock().await;
            let min_interval = Duration::from_secs(self.config.probe_min_interval_secs);
            if let Some(at) = *last {
                if at.elapsed() < min_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        if self.stopped.load(Ordering::SeqCst) || self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }

        if !self.transport.is_connected().await && !self.connecting.load(Ordering::SeqCst) {
            self.force_reconnect().await;
        }
    }

    /// Periodic liveness check: first after `watchdog_initial_secs`, then
    /// every `watchdog_interval_secs`. Each run completes before the next
    /// is scheduled.
    pub fn start_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(bridge.config.watchdog_initial_secs)).await;
            loop {
                if bridge.stopped.load(Ordering::SeqCst) {
                    break;
                }
                bridge.verify_connection().await;
                tokio::time::sleep(Duration::from_secs(bridge.config.watchdog_interval_secs))
                    .await;
            }
        })
    }

    // =========================================================================
    // Publish / inbound
    // =========================================================================

    /// Publish under this machine's namespace:
    /// `sanitize(prefix/machine/suffix)`. Never returns an error; failures
    /// are logged and trigger a forced reconnect.
    pub async fn publish(self: &Arc<Self>, suffix: &str, payload: Payload) {
        self.verify_connection().await;

        let topic = machine_topic(&self.prefix, &self.machine, suffix);
        if let Err(e) = self.transport.publish(&topic, payload.as_bytes(), false).await {
            tracing::warn!(topic = %topic, "Publish failed: {}", e);
            self.force_reconnect().await;
        }
    }

    /// Consume transport events: strip the machine namespace off inbound
    /// topics and forward them for dispatch; re-enter the connect loop on
    /// unexpected drops.
    pub fn start_inbound(
        self: &Arc<Self>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                match event {
                    TransportEvent::Message { topic, payload } => {
                        let base = format!("{}/", bridge.machine_base());
                        let Some(rest) = topic.strip_prefix(&base) else {
                            tracing::trace!(topic = %topic, "Message outside namespace dropped");
                            continue;
                        };
                        let payload = match String::from_utf8(payload) {
                            Ok(text) => Payload::Text(text),
                            Err(raw) => Payload::Bytes(raw.into_bytes()),
                        };
                        let _ = bridge
                            .event_tx
                            .send(BrokerEvent::Message {
                                topic: rest.to_string(),
                                payload,
                            })
                            .await;
                    }
                    TransportEvent::ConnectionLost { reason } => {
                        tracing::warn!("Broker connection lost: {}", reason);
                        *bridge.state.write().await = ConnectionState::Disconnected;
                        let _ = bridge.event_tx.send(BrokerEvent::Disconnected).await;
                        if !bridge.manual_disconnect.load(Ordering::SeqCst)
                            && !bridge.stopped.load(Ordering::SeqCst)
                        {
                            bridge.connect().await;
                        }
                    }
                }
            }
        })
    }
}
