//! Per-task execution
//!
//! A [`TaskExecutor`] takes one assignment from admission through container
//! creation to the end of the container's output. Every path that records the
//! task also retires it, so no reservation outlives the task.

use crate::models::ContainerSpec;
use crate::observability::{CaptainMetrics, StructuredLogger};
use crate::proto::{TaskLog, TaskRequest, Uuid};
use crate::resource::ResourceManager;
use crate::runtime::ContainerRuntime;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The container ran and its output ended
    Completed,
    /// Container creation, start or log streaming failed
    Failed(String),
    /// Refused before anything was created
    Rejected(String),
    /// The session shut down before or while the task ran
    Cancelled,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Rejected(_) => "rejected",
            TaskOutcome::Cancelled => "cancelled",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TaskOutcome::Failed(reason) | TaskOutcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.as_str(), reason),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Append the first address and port of the task's dependency, plus the
/// producing application's id, to the task's command line
///
/// Returns whether the command was changed.
pub fn wire_dependency(task: &mut TaskRequest) -> bool {
    let Some(dependency) = task.dependency.as_ref() else {
        return false;
    };
    let (Some(ip), Some(port)) = (dependency.ips.first(), dependency.ports.first()) else {
        return false;
    };

    let app_id = dependency
        .app_id
        .as_ref()
        .map(|id| id.value.clone())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| task.app_id_value().to_string());

    let (ip, port) = (ip.clone(), port.clone());
    task.command.extend([ip, port, app_id]);
    true
}

pub struct TaskExecutor {
    manager: Arc<ResourceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Set when unstarted work should be abandoned
    cancel: watch::Receiver<bool>,
    metrics: CaptainMetrics,
    logger: StructuredLogger,
}

impl TaskExecutor {
    pub fn new(
        manager: Arc<ResourceManager>,
        runtime: Arc<dyn ContainerRuntime>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let logger = StructuredLogger::new(manager.node_id().as_str());
        Self {
            manager,
            runtime,
            cancel,
            metrics: CaptainMetrics::new(),
            logger,
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run one task to completion, forwarding its output on `log`
    pub async fn execute(&self, mut task: TaskRequest, log: mpsc::Sender<TaskLog>) -> TaskOutcome {
        let task_id = task.task_id_value().to_string();
        if wire_dependency(&mut task) {
            debug!(task_id = %task_id, command = ?task.command, "Wired task dependency");
        }

        let outcome = self.run_task(&task, log).await;

        if matches!(outcome, TaskOutcome::Failed(_)) {
            self.metrics.inc_task_failures();
        }
        self.logger
            .log_task_finished(&task_id, outcome.as_str(), outcome.reason());
        outcome
    }

    async fn run_task(&self, task: &TaskRequest, log: mpsc::Sender<TaskLog>) -> TaskOutcome {
        if self.cancelled() {
            return TaskOutcome::Cancelled;
        }

        let requested = match ContainerSpec::from_task(task) {
            Ok(spec) => spec,
            Err(e) => return TaskOutcome::Rejected(e.to_string()),
        };

        let spec = match self.manager.request_resource(&requested).await {
            Ok(spec) => spec,
            Err(e) => return TaskOutcome::Rejected(e.to_string()),
        };

        self.pull_image(&spec.image).await;

        let container = match self.runtime.create(&spec).await {
            Ok(container) => container,
            Err(e) => {
                warn!(task_id = %spec.task_id, error = %e, "Container creation failed");
                self.manager.release_resource(&spec).await;
                return TaskOutcome::Failed(format!("create: {}", e));
            }
        };

        // Commit point: from here the task is tracked until retired
        self.manager
            .append_task(&spec.app_id, &spec.task_id, container.clone())
            .await;

        if self.cancelled() {
            info!(task_id = %spec.task_id, "Task cancelled, not starting container");
            self.manager
                .retire_task(&spec.app_id, &spec.task_id, &spec)
                .await;
            return TaskOutcome::Cancelled;
        }

        let mut output = match self.runtime.run(&container).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(task_id = %spec.task_id, error = %e, "Container start failed");
                self.manager
                    .retire_task(&spec.app_id, &spec.task_id, &spec)
                    .await;
                return TaskOutcome::Failed(format!("start: {}", e));
            }
        };

        info!(task_id = %spec.task_id, container_id = %container.id, "Task running");

        let mut forwarding = true;
        let mut chunks = 0u64;
        let outcome = loop {
            match output.next().await {
                Some(Ok(line)) => {
                    chunks += 1;
                    if forwarding {
                        let entry = TaskLog {
                            task_id: Some(Uuid::from(spec.task_id.as_str())),
                            line,
                        };
                        if log.send(entry).await.is_err() {
                            debug!(task_id = %spec.task_id, "Task log stream closed, dropping output");
                            forwarding = false;
                        }
                    }
                }
                Some(Err(e)) => break TaskOutcome::Failed(format!("logs: {}", e)),
                None if self.cancelled() => break TaskOutcome::Cancelled,
                None => break TaskOutcome::Completed,
            }
        };

        debug!(task_id = %spec.task_id, chunks, "Task output ended");
        self.manager
            .retire_task(&spec.app_id, &spec.task_id, &spec)
            .await;
        outcome
    }

    /// Pull the image; layer ids are recorded off the execution path
    async fn pull_image(&self, image: &str) {
        match self.runtime.pull(image).await {
            Ok(progress) => {
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    manager.record_layers(&progress);
                });
            }
            Err(e) => warn!(image = %image, error = %e, "Image pull failed, trying local image"),
        }
    }
}
