//! Service wiring and lifecycle
//!
//! Builds the four core components, pumps broker and agent events into the
//! addon registry, and owns start/stop. One instance per process.

use crate::addons::{Addon, AddonDescriptor, AddonLoader, AddonRegistry, CoreVersion, LifecycleEvent};
use crate::broker::{BrokerBridge, BrokerEvent, RumqttcTransport, TransportEvent};
use crate::config::BridgeConfig;
use crate::ipc::{AgentChannel, AgentEvent};
use crate::sessions::{LocalProcessControl, Reconciler, SystemFacts};
use crate::topic::machine_topic;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// The hostbridge service: addon registry, broker bridge, agent IPC
/// channel, and session-agent reconciler, wired together.
pub struct BridgeService {
    config: BridgeConfig,
    state: RwLock<ServiceState>,
    registry: Arc<AddonRegistry>,
    agents: Arc<AgentChannel>,
    broker: Option<Arc<BrokerBridge>>,
    reconciler: Option<Arc<Reconciler>>,
    agent_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    broker_rx: Mutex<Option<mpsc::Receiver<BrokerEvent>>>,
    transport_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BridgeService {
    /// Build the service with its default collaborators. Absence of the
    /// broker section disables the Broker Bridge only.
    pub fn new(config: BridgeConfig) -> Self {
        let registry = Arc::new(AddonRegistry::new(CoreVersion::current()));

        let (agent_tx, agent_rx) = mpsc::channel(256);
        let agents = Arc::new(AgentChannel::new(config.ipc.clone(), agent_tx));

        let mut broker = None;
        let mut broker_rx_slot = None;
        let mut transport_rx_slot = None;
        if let Some(broker_config) = &config.broker {
            let prefix = config.machine.topic_prefix.clone();
            let machine = config.machine.machine_segment();

            let (transport_tx, transport_rx) = mpsc::channel(256);
            let last_will = broker_config.announce.as_ref().map(|announce| {
                (
                    machine_topic(&prefix, &machine, &announce.topic),
                    announce.disconnected_payload.clone(),
                    announce.retain,
                )
            });
            let transport = Arc::new(RumqttcTransport::new(
                broker_config.clone(),
                format!("hostbridge-{}", machine),
                last_will,
                transport_tx,
            ));

            let (broker_tx, broker_rx) = mpsc::channel(256);
            broker = Some(Arc::new(BrokerBridge::new(
                broker_config.clone(),
                prefix,
                machine,
                transport,
                broker_tx,
            )));
            broker_rx_slot = Some(broker_rx);
            transport_rx_slot = Some(transport_rx);
        }

        let reconciler = if config.agents.enabled {
            let facts = Arc::new(SystemFacts::new());
            Some(Arc::new(Reconciler::new(
                config.agents.clone(),
                config.ipc.agent_url(),
                facts.clone(),
                facts,
                Arc::new(LocalProcessControl::new()),
            )))
        } else {
            None
        };

        Self {
            config,
            state: RwLock::new(ServiceState::Stopped),
            registry,
            agents,
            broker,
            reconciler,
            agent_rx: Mutex::new(Some(agent_rx)),
            broker_rx: Mutex::new(broker_rx_slot),
            transport_rx: Mutex::new(transport_rx_slot),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current state.
    pub async fn state(&self) -> ServiceState {
        *self.state.read().await
    }

    /// Addon registry (for registering built-ins before `start`).
    pub fn registry(&self) -> &Arc<AddonRegistry> {
        &self.registry
    }

    /// Configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Register one addon.
    pub async fn register_addon(&self, descriptor: AddonDescriptor, handler: Arc<dyn Addon>) {
        self.registry.register(descriptor, handler).await;
    }

    /// Scan the addons directory (created when absent) and offer each
    /// subdirectory to the loader. A malformed addon disables only itself.
    pub async fn load_addons(&self, loader: Arc<dyn AddonLoader>) {
        let dir = &self.config.addons.dir;
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), "Cannot create addons directory: {}", e);
            return;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "Cannot read addons directory: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match loader.load(&path).await {
                Ok(Some(loaded)) => {
                    self.registry.register(loaded.descriptor, loaded.handler).await;
                }
                Ok(None) => {
                    tracing::debug!(dir = %path.display(), "No loadable addon");
                }
                Err(e) => {
                    tracing::warn!(dir = %path.display(), "Addon load failed: {}", e);
                }
            }
        }
    }

    /// Start the service.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServiceState::Stopped {
                return Err(crate::Error::Internal(
                    "Service already running".to_string(),
                ));
            }
            *state = ServiceState::Starting;
        }

        tracing::info!("Starting hostbridge");
        let mut tasks = self.tasks.lock().await;

        // Agent IPC endpoint + liveness loop.
        let (_addr, server) = crate::ipc::serve(
            self.agents.clone(),
            &self.config.ipc.host,
            self.config.ipc.port,
        )
        .await?;
        tasks.push(server);
        tasks.push(self.agents.start_liveness());
        self.registry.set_agent_channel(self.agents.clone()).await;

        // Pump agent events into the registry / broker.
        if let Some(agent_rx) = self.agent_rx.lock().await.take() {
            tasks.push(self.spawn_agent_pump(agent_rx));
        }

        // Broker bridge, when configured.
        match &self.broker {
            Some(bridge) => {
                self.registry.set_broker(bridge.clone()).await;
                if let Some(transport_rx) = self.transport_rx.lock().await.take() {
                    tasks.push(bridge.start_inbound(transport_rx));
                }
                if let Some(broker_rx) = self.broker_rx.lock().await.take() {
                    tasks.push(self.spawn_broker_pump(broker_rx));
                }
                tasks.push(bridge.start_watchdog());
                bridge.connect().await;
            }
            None => {
                tracing::info!("Broker not configured; bridge disabled");
            }
        }

        // Session-agent reconciler.
        if let Some(reconciler) = &self.reconciler {
            tasks.push(reconciler.start());
        }

        drop(tasks);
        *self.state.write().await = ServiceState::Running;
        tracing::info!("hostbridge running");
        Ok(())
    }

    /// Stop the service: agent sweep, broker disconnect with
    /// announcement, IPC shutdown.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServiceState::Running {
                return Ok(());
            }
            *state = ServiceState::ShuttingDown;
        }

        tracing::info!("Stopping hostbridge");

        if let Some(reconciler) = &self.reconciler {
            reconciler.shutdown().await;
        }
        if let Some(bridge) = &self.broker {
            bridge.shutdown().await;
        }
        self.agents.stop();

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        *self.state.write().await = ServiceState::Stopped;
        tracing::info!("hostbridge stopped");
        Ok(())
    }

    /// Deliver a configuration-reloaded lifecycle event to addons.
    pub async fn notify_config_reloaded(&self) {
        self.registry
            .broadcast_event(LifecycleEvent::ConfigReloaded)
            .await;
    }

    /// Deliver a session-changed lifecycle event to addons.
    pub async fn notify_session_changed(&self, username: &str, reason: &str) {
        self.registry
            .broadcast_event(LifecycleEvent::SessionChanged {
                username: username.to_string(),
                reason: reason.to_string(),
            })
            .await;
    }

    fn spawn_agent_pump(
        &self,
        mut agent_rx: mpsc::Receiver<AgentEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            while let Some(event) = agent_rx.recv().await {
                match event {
                    AgentEvent::AddonResponse {
                        username,
                        addon_id,
                        data,
                    } => {
                        registry
                            .handle_agent_response(&username, &addon_id, data)
                            .await;
                    }
                    // Agent publishes skip the registry entirely.
                    AgentEvent::PublishRequested { topic, payload } => match &broker {
                        Some(bridge) => {
                            bridge
                                .publish(&topic, crate::addons::Payload::Text(payload))
                                .await;
                        }
                        None => {
                            tracing::debug!(topic = %topic, "Broker disabled, agent publish dropped");
                        }
                    },
                }
            }
        })
    }

    fn spawn_broker_pump(
        &self,
        mut broker_rx: mpsc::Receiver<BrokerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(event) = broker_rx.recv().await {
                match event {
                    BrokerEvent::Connected => {
                        registry
                            .broadcast_event(LifecycleEvent::BrokerConnected)
                            .await;
                    }
                    BrokerEvent::Disconnected => {
                        registry
                            .broadcast_event(LifecycleEvent::BrokerDisconnected)
                            .await;
                    }
                    BrokerEvent::Message { topic, payload } => {
                        registry.dispatch(&topic, payload).await;
                    }
                }
            }
        })
    }
}
