use thiserror::Error;

/// Error taxonomy for the control plane.
///
/// `kind()` returns the stable string an audit entry's `result` field
/// records on failure (`ok` is recorded directly, not through this type).
#[derive(Error, Debug)]
pub enum AgentainerError {
    #[error("no agent with id {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("invalid deployment spec: {0}")]
    InvalidSpec(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("unique name exhausted after 10 attempts")]
    UniqueNameExhausted,

    #[error("health probe failed: {0}")]
    ProbeFailure(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl AgentainerError {
    /// Stable kind string, used as the audit log's `result` on failure.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentainerError::NotFound(_) => "not-found",
            AgentainerError::InvalidState(_) => "invalid-state",
            AgentainerError::InvalidSpec(_) => "invalid-spec",
            AgentainerError::Runtime(_) => "runtime-error",
            AgentainerError::Build(_) => "build-error",
            AgentainerError::UniqueNameExhausted => "unique-name-exhausted",
            AgentainerError::ProbeFailure(_) => "probe-failure",
            AgentainerError::Storage(_) => "storage-error",
        }
    }
}

impl From<bollard::errors::Error> for AgentainerError {
    fn from(e: bollard::errors::Error) -> Self {
        AgentainerError::Runtime(e.to_string())
    }
}

impl From<redis::RedisError> for AgentainerError {
    fn from(e: redis::RedisError) -> Self {
        AgentainerError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentainerError>;
