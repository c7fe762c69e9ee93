//! Container runtime trait: the narrow surface the control plane calls
//! (spec §6 — `build`, `create`, `start`, `stop`, `kill`, `inspect`,
//! `stats`, `image_inspect`).
//!
//! Trimmed from a prior `ProcessEnvironment` trait: console
//! attach/send_command/read_log, in-place resource updates and the
//! pre-boot hook have no counterpart here and are dropped.

pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// The subset of an agent's deployment spec needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub id: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub volumes: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
}

/// Signal or native stop, mirroring a prior `StopConfig`.
#[derive(Debug, Clone)]
pub enum StopMethod {
    Signal(String),
    Native,
}

impl Default for StopMethod {
    fn default() -> Self {
        StopMethod::Native
    }
}

/// Result of `inspect`: enough to drive the state machine and crash
/// classification without exposing the full bollard type.
#[derive(Debug, Clone)]
pub struct InspectResult {
    pub running: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One-shot (non-streaming) resource snapshot.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_absolute_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Progress callback invoked with each trimmed `stream` line during a build.
pub type ProgressSink = Box<dyn Fn(String) + Send + Sync>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Build an image from a tar context; `dockerfile_name` is the
    /// descriptor's filename within that context. Streams progress to
    /// `sink` and returns the tagged name on success.
    async fn build_image(
        &self,
        context_tar: Vec<u8>,
        dockerfile_name: &str,
        tag: &str,
        sink: ProgressSink,
    ) -> RuntimeResult<String>;

    /// True if the image is present locally.
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, container_id: &str) -> RuntimeResult<()>;

    /// Graceful stop with a bounded grace period, matching spec §4.1's
    /// `Stop` transition (`stopping` until the grace period elapses).
    async fn stop(
        &self,
        container_id: &str,
        method: StopMethod,
        grace: Duration,
    ) -> RuntimeResult<()>;

    async fn kill(&self, container_id: &str) -> RuntimeResult<()>;

    async fn inspect(&self, container_id: &str) -> RuntimeResult<InspectResult>;

    /// One-shot (non-streaming) stats snapshot.
    async fn stats(&self, container_id: &str) -> RuntimeResult<Stats>;

    async fn destroy(&self, container_id: &str) -> RuntimeResult<()>;
}
