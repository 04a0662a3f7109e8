// ABOUTME: Provider trait for the container runtime that backs sandboxes
// ABOUTME: Defines the runtime-facing interface used by the controller, pool and scheduler

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container not running: {0}")]
    NotRunning(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Exec error: {0}")]
    ExecError(String),
}

impl ProviderError {
    /// Whether the container is already gone or stopped, which destroy treats as success
    pub fn is_already_gone(&self) -> bool {
        matches!(
            self,
            ProviderError::NotFound(_) | ProviderError::NotRunning(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Container configuration for creating sandboxes
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub pids_limit: i64,
    pub nofile: i64,
    pub nproc: i64,
    /// Mount point to size in megabytes
    pub tmpfs: HashMap<String, u64>,
    pub shm_size_mb: Option<u64>,
    /// `false` gives the container no network interface besides loopback
    pub network_enabled: bool,
    pub drop_all_capabilities: bool,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String, // tcp or udp
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Removing,
    Stopped,
    Dead,
    Error(String),
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// One demultiplexed frame of exec output
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamType::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamType::Stderr,
            data: data.into(),
        }
    }
}

/// A started exec with its live output stream
pub struct ExecAttachment {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<OutputChunk>>,
}

/// Container runtime interface
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check the runtime is reachable
    async fn ping(&self) -> Result<()>;

    /// Create and start a new container, pulling its image if missing
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Send SIGKILL to a container
    async fn kill_container(&self, container_id: &str) -> Result<()>;

    /// Remove a container and its anonymous volumes
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerStatus>;

    /// List ids of all containers (running or not) carrying `label` (`key=value`)
    async fn list_labeled(&self, label: &str) -> Result<Vec<String>>;

    /// Start a command inside a running container and attach to its output
    async fn exec_attach(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<ExecAttachment>;

    /// Exit code of a finished exec, `None` while it is still running
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// Current memory usage of a container in megabytes
    async fn memory_usage_mb(&self, container_id: &str) -> Result<u64>;
}
