//! Session and process facts
//!
//! The reconciler consumes these seams; the default implementations are
//! best-effort sysinfo-backed collaborators, recomputed on every call and
//! never cached across ticks.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use sysinfo::{Pid, System, Users};

/// One active interactive session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u32,
    pub username: String,
}

/// A running agent process, derived from a live process query
#[derive(Debug, Clone)]
pub struct AgentProcessRecord {
    pub session_id: u32,
    pub process_id: u32,
    pub command_line: String,
}

/// Lists active interactive sessions.
#[async_trait]
pub trait SessionEnumerator: Send + Sync {
    async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>>;
}

/// Lists running agent processes by well-known process name.
#[async_trait]
pub trait ProcessInventory: Send + Sync {
    async fn list_agent_processes(&self, process_name: &str)
        -> Result<Vec<AgentProcessRecord>>;
}

/// Launches and terminates agent processes.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch the agent for `username`'s session. Returns whether a
    /// process was started.
    async fn launch_as_user(
        &self,
        path: &Path,
        args: &[String],
        working_dir: &Path,
        username: &str,
    ) -> Result<bool>;

    /// Terminate one process. Returns whether the signal was delivered.
    async fn kill_process(&self, process_id: u32) -> Result<bool>;
}

/// sysinfo-backed session and process facts.
///
/// Sessions are approximated by grouping live processes by their session
/// id and resolving the owning user; platform-specific enumeration can
/// replace this behind the same traits.
pub struct SystemFacts;

impl SystemFacts {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemFacts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionEnumerator for SystemFacts {
    async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut system = System::new_all();
        system.refresh_all();
        let users = Users::new_with_refreshed_list();

        let mut sessions: HashMap<u32, String> = HashMap::new();
        for process in system.processes().values() {
            let Some(session_pid) = process.session_id() else {
                continue;
            };
            let Some(uid) = process.user_id() else {
                continue;
            };
            let Some(user) = users.get_user_by_id(uid) else {
                continue;
            };
            sessions
                .entry(session_pid.as_u32())
                .or_insert_with(|| user.name().to_string());
        }

        Ok(sessions
            .into_iter()
            .map(|(session_id, username)| SessionInfo {
                session_id,
                username,
            })
            .collect())
    }
}

#[async_trait]
impl ProcessInventory for SystemFacts {
    async fn list_agent_processes(
        &self,
        process_name: &str,
    ) -> Result<Vec<AgentProcessRecord>> {
        let mut system = System::new_all();
        system.refresh_all();

        let mut records = Vec::new();
        for (pid, process) in system.processes() {
            if !process
                .name()
                .to_string_lossy()
                .starts_with(process_name)
            {
                continue;
            }
            let command_line = process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            records.push(AgentProcessRecord {
                session_id: process.session_id().map(|p| p.as_u32()).unwrap_or(0),
                process_id: pid.as_u32(),
                command_line,
            });
        }
        Ok(records)
    }
}

/// Process control that spawns in the service's own context.
///
/// The impersonated per-session launch primitive is an external
/// collaborator; this implementation carries the username through the
/// trait but spawns without impersonation.
pub struct LocalProcessControl;

impl LocalProcessControl {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for LocalProcessControl {
    async fn launch_as_user(
        &self,
        path: &Path,
        args: &[String],
        working_dir: &Path,
        username: &str,
    ) -> Result<bool> {
        tracing::debug!(
            path = %path.display(),
            username,
            "Launching agent process"
        );
        tokio::process::Command::new(path)
            .args(args)
            .current_dir(working_dir)
            .spawn()
            .map(|_| true)
            .map_err(|e| Error::Session(format!("spawn {}: {}", path.display(), e)))
    }

    async fn kill_process(&self, process_id: u32) -> Result<bool> {
        let mut system = System::new_all();
        system.refresh_all();
        match system.process(Pid::from_u32(process_id)) {
            Some(process) => Ok(process.kill()),
            None => Ok(false),
        }
    }
}
