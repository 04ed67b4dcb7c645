//! hostbridge - Host-resident broker bridge for machine control
//!
//! hostbridge connects a machine to an external MQTT-style broker through
//! a pluggable addon architecture, and coordinates short-lived per-user
//! agent processes for actions that need a desktop/user context the
//! privileged service cannot reach itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      hostbridge service                      │
//! │                                                              │
//! │  ┌──────────────┐  publish/dispatch  ┌────────────────────┐  │
//! │  │ Broker Bridge│◄──────────────────►│   Addon Registry   │  │
//! │  │ (reconnect,  │                    │ (topic map, events)│  │
//! │  │  watchdog)   │                    └──────────┬─────────┘  │
//! │  └──────┬───────┘                               │            │
//! │         │ MQTT                        requests/ │ responses  │
//! │         ▼                                       ▼            │
//! │   external broker                    ┌────────────────────┐  │
//! │                                      │ Agent IPC Channel  │  │
//! │  ┌────────────────┐                  │ (WebSocket, PING)  │  │
//! │  │ Session-Agent  │                  └──────────▲─────────┘  │
//! │  │   Reconciler   │── launches ─► per-user ─────┘ dials in   │
//! │  └────────────────┘               agent processes            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A single inbound broker message traverses: Broker Bridge (decode,
//! namespace strip) → Addon Registry (exact topic lookup) → addon handler,
//! which may publish back through the bridge or reach agents through the
//! IPC channel. Every path tolerates partial failure (broker down, agent
//! unreachable, session gone) without crashing the service.
//!
//! ## Modules
//!
//! - [`addons`]: addon lifecycle, topic subscriptions, event fan-out
//! - [`broker`]: reconnecting broker client (state machine, backoff, watchdog)
//! - [`ipc`]: local WebSocket RPC channel to per-user agents
//! - [`sessions`]: session/process facts and the reconciliation loop
//! - [`service`]: top-level wiring and lifecycle
//! - [`topic`]: canonical topic path sanitization
//! - [`config`]: configuration management

pub mod addons;
pub mod broker;
pub mod config;
pub mod error;
pub mod ipc;
pub mod service;
pub mod sessions;
pub mod topic;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use service::{BridgeService, ServiceState};
