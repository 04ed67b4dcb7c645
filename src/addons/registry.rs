//! Addon registry: lifecycle, topic subscriptions, event fan-out
//!
//! Owns the topic→handler map and the addon table. Inbound broker messages
//! are dispatched by exact topic match; lifecycle events are fanned out
//! with per-addon fault isolation, so one failing handler never blocks
//! delivery to the next.

use crate::addons::{
    Addon, AddonApi, AddonDescriptor, CoreVersion, LifecycleEvent, Payload, TopicHandler,
    TopicMessage,
};
use crate::broker::BrokerBridge;
use crate::ipc::protocol::{AddonRequestData, ServerRequestType, ShowNotificationData};
use crate::ipc::AgentChannel;
use crate::topic::addon_topic;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// One registered addon, enabled or not. Disabled entries stay visible
/// for diagnostics and are never removed before shutdown.
pub struct AddonEntry {
    pub descriptor: AddonDescriptor,
    pub enabled: bool,
    handler: Arc<dyn Addon>,
}

struct Subscription {
    owner: String,
    handler: Arc<dyn TopicHandler>,
}

/// Registry for addons and their topic subscriptions.
///
/// One instance per process; handed to the broker/IPC event pump by the
/// service.
pub struct AddonRegistry {
    core_version: CoreVersion,
    addons: RwLock<Vec<AddonEntry>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    broker: RwLock<Option<Arc<BrokerBridge>>>,
    agents: RwLock<Option<Arc<AgentChannel>>>,
}

impl AddonRegistry {
    pub fn new(core_version: CoreVersion) -> Self {
        Self {
            core_version,
            addons: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(HashMap::new()),
            broker: RwLock::new(None),
            agents: RwLock::new(None),
        }
    }

    /// Wire the broker bridge (absent when the broker is unconfigured).
    pub async fn set_broker(&self, broker: Arc<BrokerBridge>) {
        *self.broker.write().await = Some(broker);
    }

    /// Wire the agent IPC channel.
    pub async fn set_agent_channel(&self, agents: Arc<AgentChannel>) {
        *self.agents.write().await = Some(agents);
    }

    // =========================================================================
    // Addon lifecycle
    // =========================================================================

    /// Register an addon. Validation failures (bad id, duplicate id,
    /// incompatible version) disable the entry but still register it;
    /// enabled addons get their `init` invoked exactly once with a
    /// manager capability handle.
    pub async fn register(
        self: &Arc<Self>,
        descriptor: AddonDescriptor,
        handler: Arc<dyn Addon>,
    ) {
        let mut failure = descriptor.validation_failure(&self.core_version);

        if failure.is_none() {
            let addons = self.addons.read().await;
            if addons
                .iter()
                .any(|e| e.descriptor.id.eq_ignore_ascii_case(&descriptor.id))
            {
                failure = Some(format!("duplicate addon id '{}'", descriptor.id));
            }
        }

        let mut enabled = failure.is_none();
        if let Some(reason) = &failure {
            tracing::warn!(addon_id = %descriptor.id, "Addon disabled: {}", reason);
        }

        if enabled {
            let api: Arc<dyn AddonApi> = Arc::new(RegistryApi {
                addon_id: descriptor.id.clone(),
                registry: Arc::downgrade(self),
            });
            if let Err(e) = handler.init(api).await {
                tracing::warn!(addon_id = %descriptor.id, "Addon init failed, disabling: {}", e);
                enabled = false;
            } else {
                tracing::info!(
                    addon_id = %descriptor.id,
                    name = %descriptor.display_name,
                    "Addon registered"
                );
            }
        }

        self.addons.write().await.push(AddonEntry {
            descriptor,
            enabled,
            handler,
        });
    }

    /// Snapshot of registered addons as `(id, display_name, enabled)`.
    pub async fn list(&self) -> Vec<(String, String, bool)> {
        self.addons
            .read()
            .await
            .iter()
            .map(|e| {
                (
                    e.descriptor.id.clone(),
                    e.descriptor.display_name.clone(),
                    e.enabled,
                )
            })
            .collect()
    }

    // =========================================================================
    // Topic subscriptions
    // =========================================================================

    /// Subscribe `addon_id` to `<addon_id>/<topic>`. Re-subscribing the
    /// same key is a no-op, never an overwrite.
    pub async fn subscribe(
        &self,
        addon_id: &str,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
    ) {
        let key = addon_topic(addon_id, topic);
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&key) {
            tracing::debug!(topic = %key, "Duplicate subscription ignored");
            return;
        }
        tracing::debug!(addon_id, topic = %key, "Topic subscribed");
        subscriptions.insert(
            key,
            Subscription {
                owner: addon_id.to_lowercase(),
                handler,
            },
        );
    }

    /// Remove a subscription created by `subscribe`.
    pub async fn unsubscribe(&self, addon_id: &str, topic: &str) {
        let key = addon_topic(addon_id, topic);
        if self.subscriptions.write().await.remove(&key).is_some() {
            tracing::debug!(addon_id, topic = %key, "Topic unsubscribed");
        }
    }

    /// Dispatch an inbound message by exact topic match. Unmatched topics
    /// are dropped silently; many machines share one broker namespace.
    pub async fn dispatch(&self, full_topic: &str, payload: Payload) {
        let handler = {
            let subscriptions = self.subscriptions.read().await;
            match subscriptions.get(full_topic) {
                Some(sub) => {
                    tracing::trace!(topic = full_topic, owner = %sub.owner, "Dispatching");
                    sub.handler.clone()
                }
                None => {
                    tracing::trace!(topic = full_topic, "No subscription, message dropped");
                    return;
                }
            }
        };

        let message = TopicMessage {
            topic: full_topic.to_string(),
            payload,
        };
        if let Err(e) = handler.on_message(&message).await {
            tracing::warn!(topic = full_topic, "Topic handler failed: {}", e);
        }
    }

    /// Number of live subscriptions (diagnostics).
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    // =========================================================================
    // Event fan-out
    // =========================================================================

    /// Broadcast a lifecycle event to every enabled addon. Each hook runs
    /// inside its own guard; a failure is logged and iteration continues.
    pub async fn broadcast_event(&self, event: LifecycleEvent) {
        let handlers: Vec<(String, Arc<dyn Addon>)> = {
            let addons = self.addons.read().await;
            addons
                .iter()
                .filter(|e| e.enabled)
                .map(|e| (e.descriptor.id.clone(), e.handler.clone()))
                .collect()
        };

        for (addon_id, handler) in handlers {
            if let Err(e) = handler.on_event(&event).await {
                tracing::warn!(addon_id = %addon_id, "Lifecycle handler failed: {}", e);
            }
        }
    }

    /// Route an agent reply to the addon it names. Unknown or disabled
    /// addon ids are dropped with a log line, never an error.
    pub async fn handle_agent_response(
        &self,
        username: &str,
        addon_id: &str,
        data: serde_json::Value,
    ) {
        let handler = {
            let addons = self.addons.read().await;
            addons
                .iter()
                .find(|e| e.enabled && e.descriptor.id.eq_ignore_ascii_case(addon_id))
                .map(|e| e.handler.clone())
        };

        match handler {
            Some(handler) => {
                if let Err(e) = handler.on_agent_response(username, data).await {
                    tracing::warn!(addon_id, username, "Agent response handler failed: {}", e);
                }
            }
            None => {
                tracing::debug!(addon_id, "Agent response for unknown addon dropped");
            }
        }
    }

    // =========================================================================
    // Outbound forwarding
    // =========================================================================

    /// Publish text under `<addon_id>/<topic>`; fire-and-forget.
    pub async fn publish_text(&self, addon_id: &str, topic: &str, payload: &str) {
        self.publish(addon_id, topic, Payload::Text(payload.to_string()))
            .await;
    }

    /// Publish raw bytes under `<addon_id>/<topic>`; fire-and-forget.
    pub async fn publish_bytes(&self, addon_id: &str, topic: &str, payload: Vec<u8>) {
        self.publish(addon_id, topic, Payload::Bytes(payload)).await;
    }

    async fn publish(&self, addon_id: &str, topic: &str, payload: Payload) {
        let suffix = addon_topic(addon_id, topic);
        let broker = self.broker.read().await.clone();
        match broker {
            Some(broker) => broker.publish(&suffix, payload).await,
            None => {
                tracing::debug!(topic = %suffix, "Broker disabled, publish dropped");
            }
        }
    }

    /// Forward an addon request to one agent (by username) or all agents.
    pub async fn send_agent_request(
        &self,
        addon_id: &str,
        data: serde_json::Value,
        username: Option<&str>,
    ) {
        let agents = self.agents.read().await.clone();
        let Some(agents) = agents else {
            tracing::warn!(addon_id, "Agent channel not wired, request dropped");
            return;
        };

        let request = AddonRequestData {
            addon_id: addon_id.to_string(),
            data,
        };
        let data = match serde_json::to_value(&request) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(addon_id, "Failed to encode agent request: {}", e);
                return;
            }
        };
        agents
            .send_request(ServerRequestType::AddonRequest, Some(data), username)
            .await;
    }

    /// Show a desktop notification via one agent or all agents.
    pub async fn show_notification(
        &self,
        title: &str,
        message: &str,
        username: Option<&str>,
    ) {
        let agents = self.agents.read().await.clone();
        let Some(agents) = agents else {
            tracing::warn!("Agent channel not wired, notification dropped");
            return;
        };

        let data = ShowNotificationData {
            title: title.to_string(),
            message: message.to_string(),
            icon_url: None,
            launch_params: None,
        };
        let data = match serde_json::to_value(&data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to encode notification: {}", e);
                return;
            }
        };
        agents
            .send_request(ServerRequestType::ShowNotification, Some(data), username)
            .await;
    }
}

/// Manager capability handed to an addon; scoped to its id.
struct RegistryApi {
    addon_id: String,
    registry: Weak<AddonRegistry>,
}

#[async_trait::async_trait]
impl AddonApi for RegistryApi {
    async fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribe(&self.addon_id, topic, handler).await;
        }
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.addon_id, topic).await;
        }
    }

    async fn publish_text(&self, topic: &str, payload: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.publish_text(&self.addon_id, topic, payload).await;
        }
    }

    async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .publish_bytes(&self.addon_id, topic, payload)
                .await;
        }
    }

    async fn send_agent_request(&self, data: serde_json::Value, username: Option<&str>) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .send_agent_request(&self.addon_id, data, username)
                .await;
        }
    }

    async fn show_notification(&self, title: &str, message: &str, username: Option<&str>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.show_notification(title, message, username).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopAddon;

    #[async_trait]
    impl Addon for NoopAddon {
        async fn init(&self, _api: Arc<dyn AddonApi>) -> crate::Result<()> {
            Ok(())
        }
    }

    struct CountingAddon {
        events: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Addon for CountingAddon {
        async fn init(&self, _api: Arc<dyn AddonApi>) -> crate::Result<()> {
            Ok(())
        }

        async fn on_event(&self, _event: &LifecycleEvent) -> crate::Result<()> {
            self.events.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::Error::Addon("boom".to_string()));
            }
            Ok(())
        }

        async fn on_agent_response(
            &self,
            _username: &str,
            _data: serde_json::Value,
        ) -> crate::Result<()> {
            self.events.fetch_add(100, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingHandler {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl TopicHandler for CountingHandler {
        async fn on_message(&self, _message: &TopicMessage) -> crate::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_registry() -> Arc<AddonRegistry> {
        Arc::new(AddonRegistry::new(CoreVersion::new(1, 0, 0, 0)))
    }

    #[tokio::test]
    async fn test_register_enabled() {
        let registry = make_registry();
        registry
            .register(AddonDescriptor::new("Commands", "Commands"), Arc::new(NoopAddon))
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert!(list[0].2);
    }

    #[tokio::test]
    async fn test_register_invalid_id_disabled_but_listed() {
        let registry = make_registry();
        registry
            .register(
                AddonDescriptor::new("bad id", "Bad"),
                Arc::new(NoopAddon),
            )
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert!(!list[0].2);
    }

    #[tokio::test]
    async fn test_register_duplicate_id_case_insensitive() {
        let registry = make_registry();
        registry
            .register(AddonDescriptor::new("Commands", "First"), Arc::new(NoopAddon))
            .await;
        registry
            .register(AddonDescriptor::new("COMMANDS", "Second"), Arc::new(NoopAddon))
            .await;

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert!(list[0].2);
        assert!(!list[1].2, "duplicate must be registered disabled");
    }

    #[tokio::test]
    async fn test_register_incompatible_version_disabled() {
        let registry = make_registry();
        let mut descriptor = AddonDescriptor::new("newer", "Needs newer core");
        descriptor.min_version = Some("9.0.0.0".parse().unwrap());
        registry.register(descriptor, Arc::new(NoopAddon)).await;

        let list = registry.list().await;
        assert!(!list[0].2);
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let registry = make_registry();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });

        registry.subscribe("commands", "run", handler.clone()).await;
        registry.subscribe("commands", "run", handler.clone()).await;

        assert_eq!(registry.subscription_count().await, 1);

        // Dispatch hits the single entry once.
        registry
            .dispatch("commands/run", Payload::Text("go".to_string()))
            .await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_key_is_sanitized() {
        let registry = make_registry();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });

        registry.subscribe("Commands", "Run Fast", handler.clone()).await;

        registry
            .dispatch("commands/run_fast", Payload::Text(String::new()))
            .await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_exact_match_only() {
        let registry = make_registry();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        registry.subscribe("commands", "run", handler.clone()).await;

        // Neither a parent nor a child topic matches.
        registry
            .dispatch("commands", Payload::Text(String::new()))
            .await;
        registry
            .dispatch("commands/run/extra", Payload::Text(String::new()))
            .await;
        assert_eq!(handler.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let registry = make_registry();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        registry.subscribe("commands", "run", handler.clone()).await;
        registry.unsubscribe("commands", "run").await;

        assert_eq!(registry.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fault_isolation() {
        let registry = make_registry();
        let failing = Arc::new(CountingAddon {
            events: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingAddon {
            events: AtomicUsize::new(0),
            fail: false,
        });

        registry
            .register(AddonDescriptor::new("failing", "Failing"), failing.clone())
            .await;
        registry
            .register(AddonDescriptor::new("healthy", "Healthy"), healthy.clone())
            .await;

        registry.broadcast_event(LifecycleEvent::BrokerConnected).await;

        // The failing addon ran and failed; the healthy one still got the event.
        assert_eq!(failing.events.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_agent_response_routed_by_id() {
        let registry = make_registry();
        let addon = Arc::new(CountingAddon {
            events: AtomicUsize::new(0),
            fail: false,
        });
        registry
            .register(AddonDescriptor::new("commands", "Commands"), addon.clone())
            .await;

        registry
            .handle_agent_response("alice", "COMMANDS", serde_json::json!({"ok": true}))
            .await;
        assert_eq!(addon.events.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_agent_response_unknown_addon_dropped() {
        let registry = make_registry();
        // No panic, no error.
        registry
            .handle_agent_response("alice", "ghost", serde_json::json!({}))
            .await;
    }

    #[tokio::test]
    async fn test_publish_without_broker_is_noop() {
        let registry = make_registry();
        registry.publish_text("commands", "state", "idle").await;
        registry
            .publish_bytes("commands", "blob", vec![1, 2, 3])
            .await;
    }
}
