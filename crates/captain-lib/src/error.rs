//! Error taxonomy for the node agent

use crate::runtime::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptainError {
    /// Host capacity could not be determined at startup
    #[error("failed to determine node capacity: {0}")]
    Capacity(#[source] RuntimeError),

    #[error("failed to connect to spinner at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("failed to attach to spinner: {0}")]
    Attach(#[source] tonic::Status),

    /// The task stream failed before a clean end-of-stream
    #[error("task stream receive failed: {0}")]
    Receive(#[source] tonic::Status),

    #[error("failed to open task log stream: {0}")]
    LogStream(#[source] tonic::Status),

    #[error("status push to spinner failed: {0}")]
    StatusPush(#[source] tonic::Status),

    #[error("invalid task {task_id:?}: {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("insufficient capacity for task {task_id}: requested {requested}, unassigned {unassigned}")]
    InsufficientCapacity {
        task_id: String,
        requested: String,
        unassigned: String,
    },

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("background loop failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CaptainError>;
