//! Core data models for the node agent

use crate::error::{CaptainError, Result};
use crate::proto::{self, TaskRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Label attached to every container this agent creates. Its value is the task id.
pub const TASK_LABEL: &str = "captain.task-id";

/// Opaque identity of this node, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// CPU shares and memory, used for both capacity and per-task limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub cpu_shares: i64,
    pub memory_bytes: i64,
}

impl Limits {
    pub fn new(cpu_shares: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_shares,
            memory_bytes,
        }
    }

    /// Whether every dimension of `self` fits into `available`
    pub fn fits_within(&self, available: &Limits) -> bool {
        self.cpu_shares <= available.cpu_shares && self.memory_bytes <= available.memory_bytes
    }

    /// Clamp each dimension to what is available, never going below zero
    pub fn clamp_to(&self, available: &Limits) -> Limits {
        Limits {
            cpu_shares: self.cpu_shares.min(available.cpu_shares).max(0),
            memory_bytes: self.memory_bytes.min(available.memory_bytes).max(0),
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cpu: {}, mem: {}}}", self.cpu_shares, self.memory_bytes)
    }
}

/// Everything needed to create one task's container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub task_id: String,
    pub app_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    /// Container port to publish on a host port chosen by the runtime
    pub port: Option<u16>,
    /// What the task asked for
    pub requested: Limits,
    /// What the container gets; equals `requested` until admission grants less
    pub limits: Limits,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Translate a task assignment into a container specification
    pub fn from_task(task: &TaskRequest) -> Result<Self> {
        let task_id = task.task_id_value().to_string();
        if task_id.is_empty() {
            return Err(CaptainError::InvalidTask {
                task_id,
                reason: "missing task id".to_string(),
            });
        }
        if task.image.trim().is_empty() {
            return Err(CaptainError::InvalidTask {
                task_id,
                reason: "missing image".to_string(),
            });
        }

        let port = match task.port {
            0 => None,
            p => Some(u16::try_from(p).map_err(|_| CaptainError::InvalidTask {
                task_id: task_id.clone(),
                reason: format!("port {} out of range", p),
            })?),
        };

        let limits = task
            .limits
            .as_ref()
            .map(|l| Limits::new(l.cpu_shares.max(0), l.memory_bytes.max(0)))
            .unwrap_or_default();

        let mut labels = HashMap::new();
        labels.insert(TASK_LABEL.to_string(), task_id.clone());

        Ok(Self {
            app_id: task.app_id_value().to_string(),
            image: task.image.clone(),
            command: task.command.clone(),
            env: task.env.clone(),
            port,
            requested: limits,
            limits,
            labels,
            task_id,
        })
    }
}

/// Handle to a container created by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
}

/// A live task: its container and owning application
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub app_id: String,
    pub container: ContainerHandle,
}

/// Capacity view of one resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub total: i64,
    pub unassigned: i64,
    pub assigned: i64,
    /// Percentage of the resource not in use, from the usage history average
    pub available_percent: f64,
}

impl ResourceSummary {
    fn to_proto(&self) -> proto::ResourceStatus {
        proto::ResourceStatus {
            total: self.total,
            unassigned: self.unassigned,
            assigned: self.assigned,
            available: self.available_percent,
        }
    }
}

/// Point-in-time aggregation of node state reported to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub cpu: ResourceSummary,
    pub memory: ResourceSummary,
    pub app_ids: Vec<String>,
    pub task_ids: Vec<String>,
    /// Task id to bound host port; empty string when the task publishes none
    pub used_ports: HashMap<String, String>,
    /// Task id to CPU utilization percentage from the latest sample
    pub task_usage: HashMap<String, f64>,
    /// Task id to assigned CPU shares
    pub assigned_cpu: HashMap<String, i64>,
    pub active_images: Vec<String>,
    pub layers: Vec<String>,
    pub generated_at: i64,
}

impl NodeStatus {
    /// Convert into the wire message sent to the scheduler
    pub fn to_proto(&self) -> proto::NodeInfo {
        let mut host_resource = HashMap::new();
        host_resource.insert("CPU".to_string(), self.cpu.to_proto());
        host_resource.insert("Memory".to_string(), self.memory.to_proto());

        proto::NodeInfo {
            captain_id: Some(proto::Uuid::from(self.node_id.as_str())),
            host_resource,
            used_ports: self.used_ports.clone(),
            container_status: Some(proto::ContainerStatus {
                active_containers: self.active_images.clone(),
                images: self.active_images.clone(),
            }),
            app_ids: self.app_ids.clone(),
            task_ids: self.task_ids.clone(),
            task_usage: self.task_usage.clone(),
            assigned_cpu: self.assigned_cpu.clone(),
            layers: self.layers.clone(),
            reported_at: Some(prost_types::Timestamp {
                seconds: self.generated_at,
                nanos: 0,
            }),
        }
    }
}
