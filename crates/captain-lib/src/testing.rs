//! In-memory runtime and scheduler used by the unit tests

use crate::models::{ContainerHandle, ContainerSpec, TASK_LABEL};
use crate::proto::{JoinRequest, NodeInfo, TaskLog, TaskRequest};
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerUsage, HostCapacity, LogStream, PullProgress,
    RuntimeError, RuntimeResult,
};
use crate::scheduler::{Scheduler, TaskStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

struct MockContainer {
    image: String,
    details: ContainerDetails,
    /// Present while the container runs; dropping it ends the log stream
    output: Option<mpsc::UnboundedSender<RuntimeResult<String>>>,
}

/// Container runtime that keeps containers in memory
///
/// Without a script, a started container runs until it is stopped.
pub struct MockRuntime {
    capacity: HostCapacity,
    containers: Mutex<HashMap<String, MockContainer>>,
    script: Option<Vec<String>>,
    pull_progress: Vec<PullProgress>,
    usage: ContainerUsage,
    fail_capacity: bool,
    fail_create: bool,
    fail_pull: bool,
    fail_usage: bool,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new(HostCapacity {
            cpu_count: 4,
            memory_bytes: 4_000,
        })
    }
}

impl MockRuntime {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            capacity,
            containers: Mutex::new(HashMap::new()),
            script: None,
            pull_progress: Vec::new(),
            usage: ContainerUsage::default(),
            fail_capacity: false,
            fail_create: false,
            fail_pull: false,
            fail_usage: false,
            next_id: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    /// A labelled container that exists before the agent starts
    pub fn with_existing(self, container: ContainerHandle, details: ContainerDetails) -> Self {
        self.containers.lock().unwrap().insert(
            container.id.clone(),
            MockContainer {
                image: container.image,
                details,
                output: None,
            },
        );
        self
    }

    /// Started containers print these lines and exit
    pub fn with_script(mut self, lines: Vec<String>) -> Self {
        self.script = Some(lines);
        self
    }

    pub fn with_pull_progress(mut self, progress: Vec<PullProgress>) -> Self {
        self.pull_progress = progress;
        self
    }

    pub fn with_usage(mut self, cpu_percent: f64, memory_percent: f64) -> Self {
        self.usage = ContainerUsage {
            cpu_percent,
            memory_percent,
        };
        self
    }

    pub fn fail_capacity(mut self) -> Self {
        self.fail_capacity = true;
        self
    }

    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn fail_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn fail_usage(mut self) -> Self {
        self.fail_usage = true;
        self
    }

    /// Register a running container outside of any task flow
    pub fn spawn_container(&self, image: &str) -> ContainerHandle {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, _rx) = mpsc::unbounded_channel();
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                image: image.to_string(),
                details: ContainerDetails::default(),
                output: Some(tx),
            },
        );
        ContainerHandle {
            id,
            image: image.to_string(),
        }
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.output.is_some())
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Emit one line of output from a running container
    pub fn emit(&self, container_id: &str, line: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .and_then(|c| c.output.as_ref())
            .map(|tx| tx.send(Ok(line.to_string())).is_ok())
            .unwrap_or(false)
    }

    /// Wait until at least `count` containers are running
    pub async fn wait_for_running(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.running_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("containers did not start in time");
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn host_capacity(&self) -> RuntimeResult<HostCapacity> {
        if self.fail_capacity {
            return Err(RuntimeError::Unavailable("mock daemon down".to_string()));
        }
        Ok(self.capacity)
    }

    async fn list(&self, _label: &str) -> RuntimeResult<Vec<ContainerHandle>> {
        let containers = self.containers.lock().unwrap();
        let mut handles: Vec<ContainerHandle> = containers
            .iter()
            .map(|(id, c)| ContainerHandle {
                id: id.clone(),
                image: c.image.clone(),
            })
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }

    async fn inspect(&self, container: &ContainerHandle) -> RuntimeResult<ContainerDetails> {
        self.containers
            .lock()
            .unwrap()
            .get(&container.id)
            .map(|c| c.details.clone())
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))
    }

    async fn pull(&self, image: &str) -> RuntimeResult<Vec<PullProgress>> {
        if self.fail_pull {
            return Err(RuntimeError::NotFound(image.to_string()));
        }
        Ok(self.pull_progress.clone())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(RuntimeError::InvalidSpec("mock create failure".to_string()));
        }
        assert_eq!(
            spec.labels.get(TASK_LABEL),
            Some(&spec.task_id),
            "containers must carry the task label"
        );

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", n);
        let host_ports = spec
            .port
            .map(|_| vec![(49_000 + n).to_string()])
            .unwrap_or_default();
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                image: spec.image.clone(),
                details: ContainerDetails {
                    footprint: spec.limits,
                    host_ports,
                },
                output: None,
            },
        );
        Ok(ContainerHandle {
            id,
            image: spec.image.clone(),
        })
    }

    async fn run(&self, container: &ContainerHandle) -> RuntimeResult<LogStream> {
        let mut containers = self.containers.lock().unwrap();
        let entry = containers
            .get_mut(&container.id)
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        match &self.script {
            Some(lines) => {
                for line in lines {
                    let _ = tx.send(Ok(line.clone()));
                }
            }
            None => entry.output = Some(tx),
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop(&self, container: &ContainerHandle) -> RuntimeResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        let entry = containers
            .get_mut(&container.id)
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))?;
        entry.output = None;
        Ok(())
    }

    async fn remove(&self, container: &ContainerHandle) -> RuntimeResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.containers
            .lock()
            .unwrap()
            .remove(&container.id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container.id.clone()))
    }

    async fn realtime_usage(&self, container_id: &str) -> RuntimeResult<ContainerUsage> {
        if self.fail_usage {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        Ok(self.usage)
    }
}

/// Scheduler that records everything the agent sends
///
/// Tasks are fed through the sender returned by [`MockScheduler::new`];
/// dropping it ends the task stream cleanly.
pub struct MockScheduler {
    tasks: Mutex<Option<mpsc::UnboundedReceiver<Result<TaskRequest, tonic::Status>>>>,
    joins: Mutex<Vec<JoinRequest>>,
    updates: Mutex<Vec<NodeInfo>>,
    logs: Arc<Mutex<Vec<TaskLog>>>,
    fail_updates: AtomicBool,
    fail_logs: AtomicBool,
    log_streams: AtomicUsize,
}

pub type TaskFeed = mpsc::UnboundedSender<Result<TaskRequest, tonic::Status>>;

impl MockScheduler {
    pub fn new() -> (Arc<Self>, TaskFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            tasks: Mutex::new(Some(rx)),
            joins: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            logs: Arc::new(Mutex::new(Vec::new())),
            fail_updates: AtomicBool::new(false),
            fail_logs: AtomicBool::new(false),
            log_streams: AtomicUsize::new(0),
        });
        (scheduler, tx)
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last_update(&self) -> Option<NodeInfo> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn join_requests(&self) -> Vec<JoinRequest> {
        self.joins.lock().unwrap().clone()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.line.clone())
            .collect()
    }

    pub fn log_stream_count(&self) -> usize {
        self.log_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn attach(&self, request: JoinRequest) -> Result<TaskStream, tonic::Status> {
        self.joins.lock().unwrap().push(request);
        let rx = self
            .tasks
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| tonic::Status::failed_precondition("already attached"))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn open_task_log(&self) -> Result<mpsc::Sender<TaskLog>, tonic::Status> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(tonic::Status::unavailable("log stream refused"));
        }
        self.log_streams.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut stream = ReceiverStream::new(rx);
            while let Some(entry) = stream.next().await {
                logs.lock().unwrap().push(entry);
            }
        });
        Ok(tx)
    }

    async fn update(&self, status: NodeInfo) -> Result<(), tonic::Status> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(tonic::Status::unavailable("spinner gone"));
        }
        self.updates.lock().unwrap().push(status);
        Ok(())
    }
}
