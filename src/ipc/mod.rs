//! Agent IPC channel
//!
//! A local WebSocket RPC endpoint for per-user agent processes: connection
//! registry, envelope protocol, ping liveness, and routing of agent
//! replies back toward the addon registry.

pub mod protocol;

mod channel;
mod server;

pub use channel::{AgentChannel, AgentEvent};
pub use server::{router, serve};
