//! Typed Redis facade: the durable record store and event bus (spec §3, §6).
//!
//! Grounded on a prior `RedisStateStore` (connection-manager held
//! behind a lock, key-prefix convention, pipelined list trim-and-expire)
//! generalised from caching ephemeral console/install logs to being the
//! single source of truth for agent records, health mirrors, and the
//! structured log/audit sorted sets.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backoff::future::retry;
use backoff::ExponentialBackoff;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{AgentainerError, Result};
use crate::events::AgentState;
use crate::store::types::{Agent, AuditEntry, AuditFilter, HealthStatus, LogEntry, LogFilter};

const HEALTH_TTL_SECONDS: i64 = 24 * 3600;
/// Retention window for tombstoned (`removed`) agent records.
const REMOVED_AGENT_TTL_SECONDS: i64 = 24 * 3600;
const LOG_RETENTION_SECONDS: i64 = 7 * 24 * 3600;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn read_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(2)),
        ..ExponentialBackoff::default()
    }
}

/// Redis-backed state store. Cheaply `Clone`able; every component holds
/// its own handle onto the same underlying connection.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    client: redis::Client,
}

impl Store {
    pub async fn connect(addr: &str, _db: i64) -> Result<Self> {
        let client = redis::Client::open(addr)
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        Ok(Self { conn, client })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ------------------------------------------------------------------
    // Agent records — `agent:{id}`
    // ------------------------------------------------------------------

    pub async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let key = format!("agent:{}", agent.id);
        let value = serde_json::to_string(agent)
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        let mut conn = self.conn();

        if matches!(agent.state, AgentState::Removed) {
            let _: () = conn
                .set_ex(&key, value, REMOVED_AGENT_TTL_SECONDS as u64)
                .await
                .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        } else {
            let _: () = conn
                .set(&key, value)
                .await
                .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let key = format!("agent:{}", id);
        let conn = self.conn();
        let value: Option<String> = retry(read_backoff(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                conn.get::<_, Option<String>>(&key)
                    .await
                    .map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(|e| AgentainerError::Storage(e.to_string()))?;

        match value {
            Some(v) => {
                let agent = serde_json::from_str(&v)
                    .map_err(|e| AgentainerError::Storage(e.to_string()))?;
                Ok(Some(agent))
            }
            None => Ok(None),
        }
    }

    pub async fn get_all_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn();
        let keys: Vec<String> = retry(read_backoff(), || {
            let mut conn = conn.clone();
            async move {
                redis::cmd("KEYS")
                    .arg("agent:*")
                    .query_async::<_, Vec<String>>(&mut conn)
                    .await
                    .map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(|e| AgentainerError::Storage(e.to_string()))?;

        let mut agents = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches("agent:");
            if let Some(agent) = self.get_agent(id).await? {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    /// Agents currently recorded as `running`, used by the health monitor
    /// to rebuild supervisors on startup or after a reconnect.
    pub async fn get_running_agents(&self) -> Result<Vec<Agent>> {
        Ok(self
            .get_all_agents()
            .await?
            .into_iter()
            .filter(|a| matches!(a.state, AgentState::Running))
            .collect())
    }

    // ------------------------------------------------------------------
    // Status pub/sub — `agent:status:{id}`
    // ------------------------------------------------------------------

    pub async fn publish_status(&self, id: &str, state: AgentState) {
        let channel = format!("agent:status:{}", id);
        let mut conn = self.conn();
        let result: std::result::Result<(), redis::RedisError> =
            conn.publish(&channel, state.to_string()).await;
        if let Err(e) = result {
            warn!(agent_id = id, error = %e, "failed to publish status event, subscribers must reconcile");
        }
    }

    /// Subscribe to every `agent:status:*` channel. Returns a raw pub/sub
    /// connection; callers drive it with `on_message()`.
    pub async fn subscribe_status_pattern(&self) -> Result<redis::aio::PubSub> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .psubscribe("agent:status:*")
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        Ok(pubsub)
    }

    // ------------------------------------------------------------------
    // Health mirror — `health:{id}`
    // ------------------------------------------------------------------

    pub async fn save_health(&self, status: &HealthStatus) -> Result<()> {
        let key = format!("health:{}", status.agent_id);
        let value = serde_json::to_string(status)
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(&key, value, HEALTH_TTL_SECONDS as u64)
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn get_health(&self, id: &str) -> Result<Option<HealthStatus>> {
        let key = format!("health:{}", id);
        let mut conn = self.conn();
        let value: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        match value {
            Some(v) => Ok(Some(
                serde_json::from_str(&v).map_err(|e| AgentainerError::Storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Logs — sorted set `logs:entries`, live tail `logs:stream`
    // ------------------------------------------------------------------

    pub async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let value = serde_json::to_string(entry)
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        self.zadd_with_retention("logs:entries", entry.timestamp, &value)
            .await?;

        let mut conn = self.conn();
        let _: std::result::Result<(), redis::RedisError> =
            conn.publish("logs:stream", &value).await;
        Ok(())
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let value = serde_json::to_string(entry)
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        self.zadd_with_retention("audit:entries", entry.timestamp, &value)
            .await
    }

    async fn zadd_with_retention(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let cutoff = now_unix() - LOG_RETENTION_SECONDS;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .zadd(key, member, score)
            .zrembyscore(key, "-inf", cutoff)
            .query_async(&mut conn)
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Query `logs:entries` within `[from, to]` (unix seconds), then apply
    /// `filter`'s component/agent/level selectors.
    pub async fn query_logs(&self, from: i64, to: i64, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        Ok(self
            .query_sorted_set::<LogEntry>("logs:entries", from, to)
            .await?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    /// Query `audit:entries` within `[from, to]` (unix seconds), then apply
    /// `filter`'s user/action/resource selectors.
    pub async fn query_audit(&self, from: i64, to: i64, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        Ok(self
            .query_sorted_set::<AuditEntry>("audit:entries", from, to)
            .await?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    async fn query_sorted_set<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<T>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn
            .zrangebyscore(key, from, to)
            .await
            .map_err(|e| AgentainerError::Storage(e.to_string()))?;
        raw.into_iter()
            .map(|v| serde_json::from_str(&v).map_err(|e| AgentainerError::Storage(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_is_positive() {
        assert!(now_unix() > 0);
    }
}
