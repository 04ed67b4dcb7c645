//! Addon hosting
//!
//! Provides the addon trait seams, descriptor validation, and the registry
//! that owns topic subscriptions and lifecycle event fan-out.

mod descriptor;
mod registry;

pub use descriptor::{AddonDescriptor, CoreVersion};
pub use registry::{AddonEntry, AddonRegistry};

use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Payload carried on a broker topic. Text and raw bytes are distinct;
/// there is no implicit conversion between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }
}

/// A message dispatched to a topic subscription
#[derive(Debug, Clone)]
pub struct TopicMessage {
    /// Sanitized addon-scoped topic (`<addon_id>/<topic...>`)
    pub topic: String,
    pub payload: Payload,
}

/// Lifecycle events broadcast to every registered addon
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    BrokerConnected,
    BrokerDisconnected,
    ConfigReloaded,
    SessionChanged {
        username: String,
        reason: String,
    },
}

/// Handler for messages arriving on a subscribed topic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_message(&self, message: &TopicMessage) -> Result<()>;
}

/// A pluggable unit of behavior hosted by the bridge.
///
/// Hooks default to no-ops; addons override what they care about. Hook
/// failures are logged by the registry and never affect other addons.
#[async_trait]
pub trait Addon: Send + Sync {
    /// Invoked exactly once at registration for enabled addons.
    async fn init(&self, api: Arc<dyn AddonApi>) -> Result<()>;

    /// Broadcast lifecycle events (connected, disconnected, config
    /// reloaded, session changed).
    async fn on_event(&self, _event: &LifecycleEvent) -> Result<()> {
        Ok(())
    }

    /// A reply from a per-session agent, addressed to this addon.
    async fn on_agent_response(
        &self,
        _username: &str,
        _data: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Manager capability handed to enabled addons at `init`.
///
/// Every operation is fire-and-forget: failures are logged inside the
/// registry/bridge, never surfaced to the addon.
#[async_trait]
pub trait AddonApi: Send + Sync {
    /// Subscribe to `<own id>/<topic>`; idempotent.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>);

    /// Remove a previous subscription.
    async fn unsubscribe(&self, topic: &str);

    /// Publish UTF-8 text under `<own id>/<topic>`.
    async fn publish_text(&self, topic: &str, payload: &str);

    /// Publish raw bytes under `<own id>/<topic>`.
    async fn publish_bytes(&self, topic: &str, payload: Vec<u8>);

    /// Send an addon request to one agent (by username) or all agents.
    async fn send_agent_request(&self, data: serde_json::Value, username: Option<&str>);

    /// Show a desktop notification via one agent or all agents.
    async fn show_notification(
        &self,
        title: &str,
        message: &str,
        username: Option<&str>,
    );
}

/// A descriptor resolved to a constructible handler
pub struct LoadedAddon {
    pub descriptor: AddonDescriptor,
    pub handler: Arc<dyn Addon>,
}

/// External collaborator that resolves an addon directory to a loadable
/// addon. Discovery/loading mechanics live behind this seam.
#[async_trait]
pub trait AddonLoader: Send + Sync {
    /// `Ok(None)` means the directory holds nothing loadable.
    async fn load(&self, dir: &Path) -> Result<Option<LoadedAddon>>;
}
