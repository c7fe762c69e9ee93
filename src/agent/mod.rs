mod manager;

pub use manager::{AgentFilter, AgentManager};
