//! Data model persisted through the state store (spec §3).

use serde::{Deserialize, Serialize};

use crate::events::AgentState;

/// Health-check configuration, attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    pub endpoint: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

/// The primary entity: a managed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub image: String,
    pub container_id: Option<String>,
    pub state: AgentState,
    pub env: std::collections::HashMap<String, String>,
    pub volumes: Vec<(String, String)>,
    pub auto_restart: bool,
    pub health_config: Option<HealthConfig>,
    pub stop_grace_secs: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Agent {
    /// `container_id` is non-empty iff `state` is `running` or `stopping` (property 1).
    pub fn container_invariant_holds(&self) -> bool {
        let has_container = self
            .container_id
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false);
        let expects_container = matches!(self.state, AgentState::Running | AgentState::Stopping);
        has_container == expects_container
    }
}

/// Input to `AgentManager::create`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploySpec {
    pub name: String,
    /// Either an image reference resolvable by the runtime, or a path to
    /// a build descriptor (see `builder::is_build_descriptor`).
    pub image_source: String,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<(String, String)>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub health_config: Option<HealthConfig>,
    pub stop_grace_secs: Option<u64>,
}

/// Derived entity, one per monitored agent while a supervisor is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub agent_id: String,
    pub healthy: bool,
    pub last_check: i64,
    pub consecutive_failures: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub agent_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: i64,
    pub user_id: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    /// `ok` on success, or the `AgentainerError::kind()` string on failure.
    pub result: String,
}

/// Secondary selector applied to `query_logs` after the time-window scan.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub component: Option<String>,
    pub agent_id: Option<String>,
    pub level: Option<LogLevel>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(component) = &self.component {
            if &entry.component != component {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if entry.agent_id.as_deref() != Some(agent_id.as_str()) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        true
    }
}

/// Secondary selector applied to `query_audit` after the time-window scan.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(user_id) = &self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            if &entry.resource != resource {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_entry(component: &str, agent_id: Option<&str>, level: LogLevel) -> LogEntry {
        LogEntry {
            timestamp: 0,
            level,
            component: component.to_string(),
            message: "msg".to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            details: None,
        }
    }

    #[test]
    fn log_filter_matches_on_component_agent_and_level() {
        let entry = log_entry("health", Some("agent-1"), LogLevel::Warn);

        assert!(LogFilter::default().matches(&entry));

        assert!(LogFilter {
            component: Some("health".into()),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!LogFilter {
            component: Some("builder".into()),
            ..Default::default()
        }
        .matches(&entry));

        assert!(LogFilter {
            agent_id: Some("agent-1".into()),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!LogFilter {
            agent_id: Some("agent-2".into()),
            ..Default::default()
        }
        .matches(&entry));

        assert!(LogFilter {
            level: Some(LogLevel::Warn),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!LogFilter {
            level: Some(LogLevel::Error),
            ..Default::default()
        }
        .matches(&entry));
    }

    #[test]
    fn audit_filter_matches_on_user_action_and_resource() {
        let entry = AuditEntry {
            timestamp: 0,
            user_id: "operator".to_string(),
            action: "restart".to_string(),
            resource: "agent".to_string(),
            resource_id: "agent-1".to_string(),
            result: "ok".to_string(),
        };

        assert!(AuditFilter::default().matches(&entry));

        assert!(AuditFilter {
            action: Some("restart".into()),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!AuditFilter {
            action: Some("stop".into()),
            ..Default::default()
        }
        .matches(&entry));
    }
}
