//! In-process event bus for agent state transitions.
//!
//! The agent manager publishes every terminal state change here, and also
//! through the Redis `agent:status:{id}` channel (see `store::redis`) for
//! external consumers. The health monitor subscribes to this bus rather
//! than round-tripping through Redis pub/sub within the same process;
//! on startup or after a gap it reconciles by listing `running` agents
//! from the store instead of trusting bus delivery.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Mirrors the agent state machine (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Pending => "pending",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
            AgentState::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgentState::Pending),
            "running" => Ok(AgentState::Running),
            "stopping" => Ok(AgentState::Stopping),
            "stopped" => Ok(AgentState::Stopped),
            "failed" => Ok(AgentState::Failed),
            "removed" => Ok(AgentState::Removed),
            other => Err(format!("unrecognised agent state: {other}")),
        }
    }
}

/// A state-change notification published on every terminal write.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub agent_id: String,
    pub state: AgentState,
}

/// Broadcasts `StatusEvent`s to every current subscriber.
///
/// Delivery is best-effort: a lagged or absent subscriber misses events
/// and must reconcile from the state store.
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
    _receiver: broadcast::Receiver<StatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Publish a status event. Returns the number of receivers notified;
    /// zero receivers is not an error, the event is simply dropped.
    pub fn publish(&self, agent_id: impl Into<String>, state: AgentState) -> usize {
        let event = StatusEvent {
            agent_id: agent_id.into(),
            state,
        };
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(state = %state, receivers, "published status event");
        receivers
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish("agent-1", AgentState::Running);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.agent_id, "agent-1");
        assert!(matches!(event.state, AgentState::Running));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish("agent-2", AgentState::Stopped);

        assert_eq!(rx1.recv().await.unwrap().agent_id, "agent-2");
        assert_eq!(rx2.recv().await.unwrap().agent_id, "agent-2");
    }

    #[test]
    fn subscriber_count_tracks_subscriptions() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn state_display_and_parse_roundtrip() {
        for s in [
            AgentState::Pending,
            AgentState::Running,
            AgentState::Stopping,
            AgentState::Stopped,
            AgentState::Failed,
            AgentState::Removed,
        ] {
            let text = s.to_string();
            let parsed: AgentState = text.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
