//! Health monitor: one supervisor task per running agent, driven by the
//! event bus rather than polling (spec §4.4).
//!
//! Grounded on `system::sink::SinkPoolMap`'s reader/writer-locked
//! get-or-create map for the supervisor registry, and on a prior
//! `reqwest`-based API client for the probe itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::AgentManager;
use crate::config::Configuration;
use crate::events::AgentState;
use crate::store::types::HealthStatus;
use crate::store::Store;

/// Tracks the live supervisor tasks, one per agent currently `running`.
///
/// Grounded on `SinkPoolMap`: a `RwLock<HashMap<...>>` read for the common
/// case (checking whether a supervisor exists) and written only on state
/// transitions, matching spec §5's stated lock-contention shape.
struct SupervisorRegistry {
    supervisors: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl SupervisorRegistry {
    fn new() -> Self {
        Self {
            supervisors: RwLock::new(HashMap::new()),
        }
    }

    fn stop(&self, agent_id: &str) {
        if let Some(handle) = self.supervisors.write().remove(agent_id) {
            handle.abort();
        }
    }

    fn replace(&self, agent_id: String, handle: JoinHandle<()>) {
        if let Some(old) = self.supervisors.write().insert(agent_id, handle) {
            old.abort();
        }
    }
}

/// The health monitor: owns the supervisor registry and the event
/// subscription loop that starts/stops supervisors on state transitions.
pub struct HealthMonitor {
    manager: Arc<AgentManager>,
    store: Store,
    config: Arc<Configuration>,
    http: reqwest::Client,
    registry: Arc<SupervisorRegistry>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<AgentManager>, store: Store, config: Arc<Configuration>) -> Self {
        Self {
            manager,
            store,
            config,
            http: reqwest::Client::new(),
            registry: Arc::new(SupervisorRegistry::new()),
        }
    }

    /// Reconciles supervisors against agents already `running` in the
    /// store, then subscribes to the event bus and spawns/stops
    /// supervisors as agents transition. Runs until `cancel` fires.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        self.reconcile().await;

        let mut rx = self.manager.events().subscribe();
        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.handle_event(event.agent_id, event.state),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "health monitor lagged behind event bus, reconciling");
                            self.reconcile().await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.shutdown().await;
    }

    /// Scenario E: rebuild supervisors for every agent recorded as
    /// `running`, without emitting spurious transitions.
    async fn reconcile(&self) {
        match self.store.get_running_agents().await {
            Ok(agents) => {
                for agent in agents {
                    self.spawn_supervisor(agent.id);
                }
            }
            Err(e) => warn!(error = %e, "failed to reconcile running agents"),
        }
    }

    fn handle_event(&self, agent_id: String, state: AgentState) {
        if matches!(state, AgentState::Running) {
            self.spawn_supervisor(agent_id);
        } else {
            self.registry.stop(&agent_id);
        }
    }

    fn spawn_supervisor(&self, agent_id: String) {
        let manager = self.manager.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let http = self.http.clone();
        let registry_id = agent_id.clone();

        let handle = tokio::spawn(async move {
            supervise(agent_id, manager, store, config, http).await;
        });
        self.registry.replace(registry_id, handle);
    }

    async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> =
            self.registry.supervisors.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }
    }
}

async fn supervise(
    agent_id: String,
    manager: Arc<AgentManager>,
    store: Store,
    config: Arc<Configuration>,
    http: reqwest::Client,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        let agent = match manager.get(&agent_id).await {
            Ok(agent) => agent,
            Err(_) => return,
        };

        if !matches!(agent.state, AgentState::Running) {
            return;
        }

        let health_config = agent.health_config.clone().unwrap_or(crate::store::types::HealthConfig {
            endpoint: config.health.endpoint.clone(),
            interval_secs: config.health.interval_secs,
            timeout_secs: config.health.timeout_secs,
            retries: config.health.retries,
        });

        let url = format!(
            "http://{}:{}/agent/{}{}",
            config.proxy.host, config.proxy.port, agent_id, health_config.endpoint
        );

        let probe_result = http
            .get(&url)
            .bearer_auth(&config.proxy.bearer_token)
            .timeout(Duration::from_secs(health_config.timeout_secs))
            .send()
            .await;

        let (healthy, message) = match probe_result {
            Ok(response) if response.status().is_success() => {
                (true, format!("probe ok ({})", response.status()))
            }
            Ok(response) => (false, format!("unhealthy status {}", response.status())),
            Err(e) => (false, format!("probe transport error: {e}")),
        };

        if healthy {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            crate::logger::log(
                crate::store::types::LogLevel::Warn,
                "health",
                &message,
                Some(agent_id.clone()),
                None,
            )
            .await;
        }

        let status = HealthStatus {
            agent_id: agent_id.clone(),
            healthy,
            last_check: now_unix(),
            consecutive_failures,
            message,
        };
        if let Err(e) = store.save_health(&status).await {
            warn!(agent_id = %agent_id, error = %e, "failed to mirror health status");
        }

        if consecutive_failures >= health_config.retries && agent.auto_restart {
            // `restart` drives the agent through `stopping`, which the
            // run loop observes and answers by aborting this very
            // supervisor task. Spawning it detached keeps the restart
            // alive past that abort; the supervisor for the new
            // `running` instance picks up monitoring with a fresh
            // failure count once it completes.
            let restart_manager = manager.clone();
            let restart_agent_id = agent_id.clone();
            tokio::spawn(async move {
                match restart_manager.restart(&restart_agent_id).await {
                    Ok(()) => info!(agent_id = %restart_agent_id, "auto-restart succeeded"),
                    Err(e) => warn!(agent_id = %restart_agent_id, error = %e, "auto-restart failed"),
                }
            });
            return;
        }

        tokio::time::sleep(Duration::from_secs(health_config.interval_secs)).await;
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
