//! hostbridge configuration management
//!
//! All liveness/backoff numerics are policy values, kept here (with the
//! documented defaults) rather than hard-coded in the components.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main hostbridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Machine identity and topic namespace
    #[serde(default)]
    pub machine: MachineConfig,

    /// Broker connection configuration. Absent → the Broker Bridge is
    /// disabled; addons and the agent IPC channel still run.
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Agent IPC channel configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Addon loading configuration
    #[serde(default)]
    pub addons: AddonsConfig,

    /// Per-session agent process configuration
    #[serde(default)]
    pub agents: AgentsConfig,
}

/// Machine identity used when composing broker topics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Topic prefix shared by all machines on the broker
    pub topic_prefix: String,

    /// Machine name; defaults to the OS hostname when empty
    pub name: Option<String>,

    /// Optional domain component, joined to the machine name with `-`
    pub domain: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "hostbridge".to_string(),
            name: None,
            domain: None,
        }
    }
}

impl MachineConfig {
    /// Machine segment of the broker topic, before sanitization.
    pub fn machine_segment(&self) -> String {
        let name = self
            .name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        match &self.domain {
            Some(domain) if !domain.trim().is_empty() => format!("{}-{}", domain, name),
            _ => name,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Optional credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// MQTT client id; defaults to `hostbridge-<machine>` when empty
    pub client_id: Option<String>,

    /// Transport keep-alive in seconds
    pub keep_alive_secs: u64,

    /// How long a single connect attempt may take before it fails
    pub connect_timeout_secs: u64,

    /// Backoff: delay = min(base * attempt, cap)
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,

    /// Watchdog: first check, then steady-state interval
    pub watchdog_initial_secs: u64,
    pub watchdog_interval_secs: u64,

    /// Minimum seconds between connection probes (rate limit for
    /// `verify_connection` under publish bursts)
    pub probe_min_interval_secs: u64,

    /// Optional connected/disconnected announcements
    #[serde(default)]
    pub announce: Option<AnnounceConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            backoff_base_secs: 5,
            backoff_cap_secs: 60,
            watchdog_initial_secs: 60,
            watchdog_interval_secs: 10,
            probe_min_interval_secs: 5,
            announce: Some(AnnounceConfig::default()),
        }
    }
}

/// Connected/disconnected announcement messages (last-will-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    /// Topic suffix under the machine namespace
    pub topic: String,

    /// Payload published after a successful connect
    pub connected_payload: String,

    /// Payload published on explicit disconnect (and set as last will)
    pub disconnected_payload: String,

    /// Retain flag for announcements
    pub retain: bool,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            topic: "lwt".to_string(),
            connected_payload: "online".to_string(),
            disconnected_payload: "offline".to_string(),
            retain: true,
        }
    }
}

/// Agent IPC channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Host to bind the WebSocket endpoint to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Seconds between PING broadcasts to registered agents
    pub ping_interval_secs: u64,

    /// Seconds without an ack before a client is evicted
    pub client_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9799,
            ping_interval_secs: 10,
            client_timeout_secs: 30,
        }
    }
}

impl IpcConfig {
    /// WebSocket URL agents should dial.
    pub fn agent_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// Addon loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonsConfig {
    /// Directory scanned for external addons; created when absent
    pub dir: PathBuf,
}

impl Default for AddonsConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir: base.join("hostbridge").join("addons"),
        }
    }
}

/// Per-session agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Whether the session-agent reconciler runs
    pub enabled: bool,

    /// Agent executable launched once per interactive session
    pub executable: PathBuf,

    /// Well-known process name used when enumerating agent processes
    pub process_name: String,

    /// Marker token expected in a running agent's command line
    pub marker: String,

    /// Seconds between reconciler ticks
    pub interval_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            executable: PathBuf::from("hostbridge-agent"),
            process_name: "hostbridge-agent".to_string(),
            marker: "--hostbridge-agent".to_string(),
            interval_secs: 7,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Default configuration rendered as YAML (for `config --default`).
    pub fn default_yaml() -> String {
        serde_yaml::to_string(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.broker.is_none());
        assert_eq!(config.ipc.port, 9799);
        assert_eq!(config.ipc.ping_interval_secs, 10);
        assert_eq!(config.ipc.client_timeout_secs, 30);
        assert_eq!(config.agents.interval_secs, 7);
    }

    #[test]
    fn test_broker_defaults() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.backoff_base_secs, 5);
        assert_eq!(broker.backoff_cap_secs, 60);
        assert_eq!(broker.watchdog_initial_secs, 60);
        assert_eq!(broker.watchdog_interval_secs, 10);
        assert_eq!(broker.probe_min_interval_secs, 5);
    }

    #[test]
    fn test_machine_segment_with_domain() {
        let machine = MachineConfig {
            topic_prefix: "home".to_string(),
            name: Some("OFFICE-PC".to_string()),
            domain: Some("CORP".to_string()),
        };
        assert_eq!(machine.machine_segment(), "CORP-OFFICE-PC");
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "machine:\n  topic_prefix: home\n  name: OFFICE-PC\nbroker:\n  host: broker.local\n  port: 1883\n  keep_alive_secs: 30\n  connect_timeout_secs: 10\n  backoff_base_secs: 2\n  backoff_cap_secs: 20\n  watchdog_initial_secs: 60\n  watchdog_interval_secs: 10\n  probe_min_interval_secs: 5\n",
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.machine.topic_prefix, "home");
        let broker = config.broker.unwrap();
        assert_eq!(broker.host, "broker.local");
        assert_eq!(broker.backoff_base_secs, 2);
        assert_eq!(broker.backoff_cap_secs, 20);
    }

    #[test]
    fn test_default_yaml_round_trips() {
        let yaml = BridgeConfig::default_yaml();
        let parsed: BridgeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.ipc.port, BridgeConfig::default().ipc.port);
    }
}
