//! Container runtime capability
//!
//! The agent drives containers only through [`ContainerRuntime`]. The Docker
//! implementation lives in [`docker`]; tests use in-memory implementations.

mod docker;
mod pull;

pub use docker::DockerRuntime;
pub use pull::PullProgress;

use crate::models::{ContainerHandle, ContainerSpec, Limits};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Output of a running container, one chunk per item
pub type LogStream = BoxStream<'static, RuntimeResult<String>>;

/// Resources the host reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub cpu_count: i64,
    pub memory_bytes: i64,
}

impl From<HostCapacity> for Limits {
    fn from(host: HostCapacity) -> Self {
        Limits::new(host.cpu_count, host.memory_bytes)
    }
}

/// Inspection result for one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    /// CPU shares and memory limit configured on the container
    pub footprint: Limits,
    /// Host ports bound to the container's published ports
    pub host_ports: Vec<String>,
}

/// Live utilization of one container, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// CPU count and total memory of the host
    async fn host_capacity(&self) -> RuntimeResult<HostCapacity>;

    /// Running containers carrying `label`
    async fn list(&self, label: &str) -> RuntimeResult<Vec<ContainerHandle>>;

    async fn inspect(&self, container: &ContainerHandle) -> RuntimeResult<ContainerDetails>;

    /// Pull an image, returning the progress records reported while pulling
    async fn pull(&self, image: &str) -> RuntimeResult<Vec<PullProgress>>;

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle>;

    /// Start the container and follow its output
    async fn run(&self, container: &ContainerHandle) -> RuntimeResult<LogStream>;

    async fn stop(&self, container: &ContainerHandle) -> RuntimeResult<()>;

    async fn remove(&self, container: &ContainerHandle) -> RuntimeResult<()>;

    async fn realtime_usage(&self, container_id: &str) -> RuntimeResult<ContainerUsage>;
}
