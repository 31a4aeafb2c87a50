//! Node resource accounting
//!
//! [`ResourceManager`] admits tasks against finite capacity and aggregates
//! node status; [`SamplingLoop`] and [`ReportingLoop`] keep usage and the
//! scheduler's view current.

pub mod history;
mod loops;
mod manager;

pub use history::{UsageHistory, UsageSample};
pub use loops::{LoopConfig, ReportingLoop, SamplingLoop};
pub use manager::{AdmissionPolicy, ResourceManager};
