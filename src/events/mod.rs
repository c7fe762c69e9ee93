//! Event system module
//!
//! Provides an in-process pub/sub bus for agent state transitions.

mod bus;

pub use bus::{AgentState, EventBus, StatusEvent};
