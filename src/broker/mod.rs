//! Broker connectivity
//!
//! The transport capability wraps the MQTT client; the bridge owns the
//! connection state machine, backoff, watchdog, and topic full-naming.

mod bridge;
mod transport;

pub use bridge::{backoff_delay, BrokerBridge, BrokerEvent, ConnectionState};
pub use transport::{BrokerTransport, RumqttcTransport, TransportEvent};
