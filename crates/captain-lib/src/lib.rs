//! Captain node agent library
//!
//! This crate provides the core functionality for:
//! - Attaching to the spinner scheduler and streaming tasks
//! - Admitting tasks against the node's CPU and memory capacity
//! - Running task containers through Docker
//! - Sampling usage and reporting node status
//! - Health checks and observability

pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod resource;
pub mod runtime;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{CaptainError, Result};
pub use executor::{TaskExecutor, TaskOutcome};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CaptainMetrics, StructuredLogger};
pub use resource::{AdmissionPolicy, LoopConfig, ResourceManager};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use scheduler::{ClientConfig, GrpcScheduler, Scheduler};
pub use session::{
    Coordinates, LocationHint, NodeRegistration, Session, SessionBuilder, SessionConfig,
    SessionState, StaticGeolocator,
};
