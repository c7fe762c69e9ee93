//! Agent manager: owns the agent entity and its state machine, serves
//! create/start/stop/restart/list/get/remove (spec §4.1, §4.3).
//!
//! Grounded on a prior `server/manager.rs` for the `DashMap`-indexed
//! entity registry and its init/shutdown loop shape, generalised from
//! Panel-backed servers to locally created agents. Per-id serialization
//! uses one `system::locker::Locker` per id, matching spec §4.1's "a
//! single coarse per-id mutex... is sufficient."

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::builder;
use crate::config::Configuration;
use crate::error::{AgentainerError, Result};
use crate::events::{AgentState, EventBus};
use crate::runtime::{AgentRuntime, ContainerSpec, StopMethod};
use crate::store::types::{Agent, DeploySpec, HealthConfig};
use crate::store::Store;
use crate::system::Locker;

/// Filter applied by `list`.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub state: Option<AgentState>,
    pub name_prefix: Option<String>,
}

impl AgentFilter {
    fn matches(&self, agent: &Agent) -> bool {
        if let Some(state) = self.state {
            if agent.state != state {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !agent.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct AgentManager {
    store: Store,
    runtime: Arc<dyn AgentRuntime>,
    events: EventBus,
    lockers: DashMap<String, Arc<Locker>>,
    config: Arc<Configuration>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl AgentManager {
    pub fn new(
        store: Store,
        runtime: Arc<dyn AgentRuntime>,
        events: EventBus,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            store,
            runtime,
            events,
            lockers: DashMap::new(),
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn locker_for(&self, id: &str) -> Arc<Locker> {
        self.lockers
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Locker::new()))
            .clone()
    }

    async fn persist_and_emit(&self, agent: &Agent) -> Result<()> {
        self.store.save_agent(agent).await?;
        self.events.publish(agent.id.clone(), agent.state);
        self.store.publish_status(&agent.id, agent.state).await;
        Ok(())
    }

    async fn audited<F, T>(&self, action: &str, resource_id: &str, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let result = op.await;
        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind().to_string(),
        };
        crate::logger::audit("operator", action, "agent", resource_id, &outcome).await;
        result
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub async fn create(&self, spec: DeploySpec) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let fut = async {
            if spec.name.trim().is_empty() {
                return Err(AgentainerError::InvalidSpec("name must not be empty".into()));
            }

            let image = if builder::is_build_descriptor(Path::new(&spec.image_source)) {
                let sink: crate::runtime::ProgressSink = Box::new(|line| {
                    info!(line, "build progress");
                });
                builder::build(
                    &spec.name,
                    Path::new(&spec.image_source),
                    self.runtime.as_ref(),
                    sink,
                )
                .await?
            } else {
                spec.image_source.clone()
            };

            let health_config = spec.health_config.clone().unwrap_or(HealthConfig {
                endpoint: self.config.health.endpoint.clone(),
                interval_secs: self.config.health.interval_secs,
                timeout_secs: self.config.health.timeout_secs,
                retries: self.config.health.retries,
            });

            let now = now_unix();
            let agent = Agent {
                id: id.clone(),
                name: spec.name.clone(),
                image,
                container_id: None,
                state: AgentState::Pending,
                env: spec.env.clone(),
                volumes: spec.volumes.clone(),
                auto_restart: spec.auto_restart,
                health_config: Some(health_config),
                stop_grace_secs: spec.stop_grace_secs.unwrap_or(self.config.stop_grace_secs),
                created_at: now,
                updated_at: now,
            };

            self.persist_and_emit(&agent).await?;
            Ok(id.clone())
        };

        self.audited("create", &id, fut).await
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<()> {
        let locker = self.locker_for(id);
        let _guard = locker.acquire().await.map_err(|_| {
            AgentainerError::InvalidState("lock acquisition cancelled".into())
        })?;

        self.audited("start", id, self.do_start(id)).await
    }

    async fn do_start(&self, id: &str) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| AgentainerError::NotFound(id.to_string()))?;

        if !matches!(
            agent.state,
            AgentState::Pending | AgentState::Stopped | AgentState::Failed
        ) {
            return Err(AgentainerError::InvalidState(format!(
                "cannot start agent in state {}",
                agent.state
            )));
        }

        let spec = ContainerSpec {
            id: agent.id.clone(),
            image: agent.image.clone(),
            env: agent.env.clone(),
            volumes: agent.volumes.clone(),
            labels: HashMap::new(),
        };

        match self.runtime.create(&spec).await {
            Ok(container_id) => match self.runtime.start(&container_id).await {
                Ok(()) => {
                    agent.container_id = Some(container_id);
                    agent.state = AgentState::Running;
                    agent.updated_at = now_unix();
                    self.persist_and_emit(&agent).await?;
                    Ok(())
                }
                Err(e) => {
                    agent.state = AgentState::Failed;
                    agent.updated_at = now_unix();
                    let _ = self.persist_and_emit(&agent).await;
                    Err(AgentainerError::Runtime(e.to_string()))
                }
            },
            Err(e) => {
                agent.state = AgentState::Failed;
                agent.updated_at = now_unix();
                let _ = self.persist_and_emit(&agent).await;
                Err(AgentainerError::Runtime(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    pub async fn stop(&self, id: &str) -> Result<()> {
        let locker = self.locker_for(id);
        let _guard = locker.acquire().await.map_err(|_| {
            AgentainerError::InvalidState("lock acquisition cancelled".into())
        })?;

        self.audited("stop", id, self.do_stop(id)).await
    }

    async fn do_stop(&self, id: &str) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| AgentainerError::NotFound(id.to_string()))?;

        if !matches!(agent.state, AgentState::Running) {
            return Err(AgentainerError::InvalidState(format!(
                "cannot stop agent in state {}",
                agent.state
            )));
        }

        agent.state = AgentState::Stopping;
        agent.updated_at = now_unix();
        self.persist_and_emit(&agent).await?;

        if let Some(container_id) = agent.container_id.clone() {
            let grace = Duration::from_secs(agent.stop_grace_secs);
            if let Err(e) = self
                .runtime
                .stop(&container_id, StopMethod::Native, grace)
                .await
            {
                warn!(agent_id = id, error = %e, "graceful stop failed, killing");
            }

            tokio::time::sleep(grace).await;

            if let Ok(inspect) = self.runtime.inspect(&container_id).await {
                if inspect.running {
                    let _ = self.runtime.kill(&container_id).await;
                }
            }
        }

        agent.container_id = None;
        agent.state = AgentState::Stopped;
        agent.updated_at = now_unix();
        self.persist_and_emit(&agent).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------

    /// Equivalent to Stop then Start, atomic from the caller's view: a
    /// failure during the start half leaves the agent `Failed`, never
    /// `Stopped`.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let locker = self.locker_for(id);
        let _guard = locker.acquire().await.map_err(|_| {
            AgentainerError::InvalidState("lock acquisition cancelled".into())
        })?;

        let fut = async {
            self.do_stop(id).await?;
            self.do_start(id).await
        };
        self.audited("restart", id, fut).await
    }

    // ------------------------------------------------------------------
    // Get / List / Remove
    // ------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Agent> {
        self.store
            .get_agent(id)
            .await?
            .ok_or_else(|| AgentainerError::NotFound(id.to_string()))
    }

    pub async fn list(&self, filter: AgentFilter) -> Result<Vec<Agent>> {
        Ok(self
            .store
            .get_all_agents()
            .await?
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let locker = self.locker_for(id);
        let _guard = locker.acquire().await.map_err(|_| {
            AgentainerError::InvalidState("lock acquisition cancelled".into())
        })?;

        self.audited("remove", id, self.do_remove(id)).await
    }

    async fn do_remove(&self, id: &str) -> Result<()> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| AgentainerError::NotFound(id.to_string()))?;

        if !matches!(agent.state, AgentState::Stopped | AgentState::Failed) {
            return Err(AgentainerError::InvalidState(format!(
                "cannot remove agent in state {}",
                agent.state
            )));
        }

        agent.state = AgentState::Removed;
        agent.updated_at = now_unix();
        self.persist_and_emit(&agent).await?;
        self.lockers.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_state_and_prefix() {
        let agent = Agent {
            id: "1".into(),
            name: "worker-a".into(),
            image: "img".into(),
            container_id: None,
            state: AgentState::Running,
            env: HashMap::new(),
            volumes: vec![],
            auto_restart: false,
            health_config: None,
            stop_grace_secs: 10,
            created_at: 0,
            updated_at: 0,
        };

        let by_state = AgentFilter {
            state: Some(AgentState::Running),
            name_prefix: None,
        };
        assert!(by_state.matches(&agent));

        let by_wrong_state = AgentFilter {
            state: Some(AgentState::Stopped),
            name_prefix: None,
        };
        assert!(!by_wrong_state.matches(&agent));

        let by_prefix = AgentFilter {
            state: None,
            name_prefix: Some("worker".into()),
        };
        assert!(by_prefix.matches(&agent));
    }
}
