//! Interactive sessions and per-session agent processes
//!
//! Capability traits for session/process facts plus the reconciler that
//! keeps exactly one agent process per active interactive session.

mod facts;
mod reconciler;

pub use facts::{
    AgentProcessRecord, LocalProcessControl, ProcessControl, ProcessInventory,
    SessionEnumerator, SessionInfo, SystemFacts,
};
pub use reconciler::Reconciler;
