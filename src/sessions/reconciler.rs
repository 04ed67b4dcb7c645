//! Session-agent reconciliation loop
//!
//! Every tick compares active interactive sessions against running agent
//! processes and launches an agent for any unserved session. A session
//! counts as served only when a record matches its session id AND carries
//! the agent marker token in its command line. The loop never launches a
//! second agent for a served session.

use crate::config::AgentsConfig;
use crate::sessions::{ProcessControl, ProcessInventory, SessionEnumerator};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Keeps a 1:1 mapping between interactive sessions and agent processes.
pub struct Reconciler {
    config: AgentsConfig,
    /// Local IPC address handed to launched agents
    agent_url: String,
    sessions: Arc<dyn SessionEnumerator>,
    inventory: Arc<dyn ProcessInventory>,
    control: Arc<dyn ProcessControl>,
    stopped: AtomicBool,
}

impl Reconciler {
    pub fn new(
        config: AgentsConfig,
        agent_url: String,
        sessions: Arc<dyn SessionEnumerator>,
        inventory: Arc<dyn ProcessInventory>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            config,
            agent_url,
            sessions,
            inventory,
            control,
            stopped: AtomicBool::new(false),
        }
    }

    /// One reconciliation pass. Returns the number of launches performed.
    /// Failures are logged; the next tick retries.
    pub async fn tick(&self) -> usize {
        let sessions = match self.sessions.list_active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("Session enumeration failed: {}", e);
                return 0;
            }
        };

        let records = match self
            .inventory
            .list_agent_processes(&self.config.process_name)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Agent process query failed: {}", e);
                return 0;
            }
        };

        let mut launched = 0;
        for session in sessions {
            let served = records.iter().any(|record| {
                record.session_id == session.session_id
                    && record.command_line.contains(&self.config.marker)
            });
            if served {
                continue;
            }

            let args = vec![
                self.config.marker.clone(),
                "--ipc-url".to_string(),
                self.agent_url.clone(),
            ];
            let working_dir = self
                .config
                .executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));

            match self
                .control
                .launch_as_user(
                    &self.config.executable,
                    &args,
                    &working_dir,
                    &session.username,
                )
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        session_id = session.session_id,
                        username = %session.username,
                        "Agent launched"
                    );
                    launched += 1;
                }
                Ok(false) => {
                    tracing::warn!(
                        session_id = session.session_id,
                        username = %session.username,
                        "Agent launch reported no process"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = session.session_id,
                        username = %session.username,
                        "Agent launch failed: {}",
                        e
                    );
                }
            }
        }
        launched
    }

    /// Periodic loop; each tick runs to completion before the next sleep.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(reconciler.config.interval_secs);
            loop {
                if reconciler.stopped.load(Ordering::SeqCst) {
                    break;
                }
                reconciler.tick().await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Stop the loop and terminate every agent process by name. One
    /// failed termination never prevents the others.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let records = match self
            .inventory
            .list_agent_processes(&self.config.process_name)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Agent sweep query failed: {}", e);
                return;
            }
        };

        for record in records {
            match self.control.kill_process(record.process_id).await {
                Ok(true) => {
                    tracing::info!(pid = record.process_id, "Agent terminated");
                }
                Ok(false) => {
                    tracing::warn!(pid = record.process_id, "Agent already gone");
                }
                Err(e) => {
                    tracing::warn!(pid = record.process_id, "Agent termination failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{AgentProcessRecord, SessionInfo};
    use crate::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::sync::Mutex;

    struct MockSessions {
        sessions: Vec<SessionInfo>,
        fail: bool,
    }

    #[async_trait]
    impl SessionEnumerator for MockSessions {
        async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>> {
            if self.fail {
                return Err(crate::Error::Session("wts unavailable".to_string()));
            }
            Ok(self.sessions.clone())
        }
    }

    struct MockInventory {
        records: Vec<AgentProcessRecord>,
    }

    #[async_trait]
    impl ProcessInventory for MockInventory {
        async fn list_agent_processes(
            &self,
            _process_name: &str,
        ) -> Result<Vec<AgentProcessRecord>> {
            Ok(self.records.clone())
        }
    }

    #[derive(Default)]
    struct MockControl {
        launches: Mutex<Vec<(String, Vec<String>)>>,
        kills: Mutex<Vec<u32>>,
        fail_kill_pids: Vec<u32>,
    }

    #[async_trait]
    impl ProcessControl for MockControl {
        async fn launch_as_user(
            &self,
            path: &Path,
            args: &[String],
            _working_dir: &Path,
            username: &str,
        ) -> Result<bool> {
            self.launches.lock().await.push((
                format!("{}:{}", username, path.display()),
                args.to_vec(),
            ));
            Ok(true)
        }

        async fn kill_process(&self, process_id: u32) -> Result<bool> {
            if self.fail_kill_pids.contains(&process_id) {
                return Err(crate::Error::Session("access denied".to_string()));
            }
            self.kills.lock().await.push(process_id);
            Ok(true)
        }
    }

    fn config() -> AgentsConfig {
        AgentsConfig {
            interval_secs: 1,
            ..AgentsConfig::default()
        }
    }

    fn session(id: u32, username: &str) -> SessionInfo {
        SessionInfo {
            session_id: id,
            username: username.to_string(),
        }
    }

    fn agent_record(session_id: u32, pid: u32, marker: bool) -> AgentProcessRecord {
        let command_line = if marker {
            format!("hostbridge-agent {} --ipc-url ws://127.0.0.1:9799/ws", AgentsConfig::default().marker)
        } else {
            "hostbridge-agent --other-mode".to_string()
        };
        AgentProcessRecord {
            session_id,
            process_id: pid,
            command_line,
        }
    }

    fn make(
        sessions: Vec<SessionInfo>,
        records: Vec<AgentProcessRecord>,
        control: Arc<MockControl>,
    ) -> Reconciler {
        Reconciler::new(
            config(),
            "ws://127.0.0.1:9799/ws".to_string(),
            Arc::new(MockSessions {
                sessions,
                fail: false,
            }),
            Arc::new(MockInventory { records }),
            control,
        )
    }

    #[tokio::test]
    async fn test_served_session_launches_nothing() {
        let control = Arc::new(MockControl::default());
        let reconciler = make(
            vec![session(1, "alice")],
            vec![agent_record(1, 100, true)],
            control.clone(),
        );

        assert_eq!(reconciler.tick().await, 0);
        assert!(control.launches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unserved_session_launches_exactly_one() {
        let control = Arc::new(MockControl::default());
        let reconciler = make(vec![session(1, "alice")], vec![], control.clone());

        assert_eq!(reconciler.tick().await, 1);
        let launches = control.launches.lock().await;
        assert_eq!(launches.len(), 1);
        // Marker token and IPC address are on the command line.
        assert!(launches[0].1.contains(&AgentsConfig::default().marker));
        assert!(launches[0]
            .1
            .contains(&"ws://127.0.0.1:9799/ws".to_string()));
    }

    #[tokio::test]
    async fn test_record_without_marker_does_not_serve() {
        let control = Arc::new(MockControl::default());
        let reconciler = make(
            vec![session(1, "alice")],
            vec![agent_record(1, 100, false)],
            control.clone(),
        );

        assert_eq!(reconciler.tick().await, 1);
    }

    #[tokio::test]
    async fn test_record_for_other_session_does_not_serve() {
        let control = Arc::new(MockControl::default());
        let reconciler = make(
            vec![session(1, "alice"), session(2, "bob")],
            vec![agent_record(1, 100, true)],
            control.clone(),
        );

        // Session 2 gets an agent, session 1 is already served.
        assert_eq!(reconciler.tick().await, 1);
        let launches = control.launches.lock().await;
        assert!(launches[0].0.starts_with("bob:"));
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_quiet() {
        let control = Arc::new(MockControl::default());
        let reconciler = Reconciler::new(
            config(),
            "ws://127.0.0.1:9799/ws".to_string(),
            Arc::new(MockSessions {
                sessions: vec![],
                fail: true,
            }),
            Arc::new(MockInventory { records: vec![] }),
            control.clone(),
        );

        assert_eq!(reconciler.tick().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_sweeps_all_agents_past_failures() {
        let control = Arc::new(MockControl {
            fail_kill_pids: vec![100],
            ..MockControl::default()
        });
        let reconciler = make(
            vec![],
            vec![
                agent_record(1, 100, true),
                agent_record(2, 200, true),
                agent_record(3, 300, false),
            ],
            control.clone(),
        );

        reconciler.shutdown().await;

        // Pid 100 failed; 200 and 300 were still terminated (sweep is by
        // process name, marker or not).
        let kills = control.kills.lock().await;
        assert_eq!(kills.as_slice(), &[200, 300]);
    }
}
