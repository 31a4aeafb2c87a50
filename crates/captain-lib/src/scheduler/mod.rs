//! Scheduler (spinner) client
//!
//! The session and the resource manager talk to the spinner only through
//! [`Scheduler`]. [`GrpcScheduler`] implements it over tonic.

mod grpc;

pub use grpc::{ClientConfig, GrpcScheduler};

use crate::proto::{JoinRequest, NodeInfo, TaskLog, TaskRequest};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// Server-to-client stream of task assignments
pub type TaskStream = BoxStream<'static, Result<TaskRequest, tonic::Status>>;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register this node and open the task stream
    async fn attach(&self, request: JoinRequest) -> Result<TaskStream, tonic::Status>;

    /// Open a log stream for one task; dropping the sender ends the stream
    async fn open_task_log(&self) -> Result<mpsc::Sender<TaskLog>, tonic::Status>;

    /// Send a node status report
    async fn update(&self, status: NodeInfo) -> Result<(), tonic::Status>;
}
