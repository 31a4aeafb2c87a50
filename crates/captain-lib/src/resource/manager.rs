//! Resource manager
//!
//! Owns the node's capacity accounting and the table of running tasks. All
//! mutable state sits behind one mutex that is never held across an await;
//! status pushes happen after the lock is released.

use super::history::{UsageHistory, UsageSample};
use crate::error::{CaptainError, Result};
use crate::models::{
    ContainerHandle, ContainerSpec, Limits, NodeId, NodeStatus, ResourceSummary, TaskRecord,
    TASK_LABEL,
};
use crate::observability::{CaptainMetrics, StructuredLogger};
use crate::runtime::{ContainerRuntime, PullProgress};
use crate::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// What to do with a request that exceeds unassigned capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Grant whatever is left, per dimension
    #[default]
    Clamp,
    /// Refuse the task and reserve nothing
    Reject,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clamp" => Ok(AdmissionPolicy::Clamp),
            "reject" => Ok(AdmissionPolicy::Reject),
            other => Err(format!(
                "unknown admission policy {:?} (expected clamp or reject)",
                other
            )),
        }
    }
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Clamp => f.write_str("clamp"),
            AdmissionPolicy::Reject => f.write_str("reject"),
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    total: Limits,
    unassigned: Limits,
    tasks: HashMap<String, TaskRecord>,
    /// App id to number of live tasks
    app_ids: HashMap<String, usize>,
    /// Task id to host port; empty when the task publishes none
    used_ports: HashMap<String, String>,
    /// Task id to granted reservation
    assigned: HashMap<String, Limits>,
    layers: BTreeSet<String>,
    active_images: Vec<String>,
    cpu_usage: UsageHistory,
    memory_usage: UsageHistory,
}

impl NodeState {
    fn release(&mut self, task_id: &str) -> Option<Limits> {
        let granted = self.assigned.remove(task_id)?;
        self.unassigned.cpu_shares += granted.cpu_shares;
        self.unassigned.memory_bytes += granted.memory_bytes;
        Some(granted)
    }

    fn remove(&mut self, app_id: &str, task_id: &str) -> Option<TaskRecord> {
        let record = self.tasks.remove(task_id)?;
        if record.app_id != app_id {
            warn!(
                task_id = %task_id,
                app_id = %app_id,
                recorded_app_id = %record.app_id,
                "Task removed under a different app id than it was added with"
            );
        }
        if let Some(count) = self.app_ids.get_mut(&record.app_id) {
            *count -= 1;
            if *count == 0 {
                self.app_ids.remove(&record.app_id);
            }
        }
        self.used_ports.remove(task_id);
        Some(record)
    }
}

/// Capacity accounting, task table and usage history of this node
pub struct ResourceManager {
    node_id: NodeId,
    policy: AdmissionPolicy,
    state: Mutex<NodeState>,
    scheduler: RwLock<Option<Arc<dyn Scheduler>>>,
    metrics: CaptainMetrics,
    logger: StructuredLogger,
}

impl ResourceManager {
    /// Build from explicit capacity figures
    pub fn new(node_id: NodeId, total: Limits, unassigned: Limits, policy: AdmissionPolicy) -> Self {
        let metrics = CaptainMetrics::new();
        metrics.set_unassigned(&unassigned);
        metrics.set_running_tasks(0);

        Self {
            logger: StructuredLogger::new(node_id.as_str()),
            node_id,
            policy,
            state: Mutex::new(NodeState {
                total,
                unassigned,
                ..Default::default()
            }),
            scheduler: RwLock::new(None),
            metrics,
        }
    }

    /// Compute capacity from the host minus what labelled containers already hold
    pub async fn initialize(
        node_id: NodeId,
        runtime: &dyn ContainerRuntime,
        policy: AdmissionPolicy,
    ) -> Result<Self> {
        let total: Limits = runtime
            .host_capacity()
            .await
            .map_err(CaptainError::Capacity)?
            .into();

        let mut unassigned = total;
        let existing = runtime
            .list(TASK_LABEL)
            .await
            .map_err(CaptainError::Capacity)?;
        for container in &existing {
            let details = runtime
                .inspect(container)
                .await
                .map_err(CaptainError::Capacity)?;
            unassigned.cpu_shares -= details.footprint.cpu_shares;
            unassigned.memory_bytes -= details.footprint.memory_bytes;
        }

        info!(
            node_id = %node_id,
            total = %total,
            unassigned = %unassigned,
            existing_containers = existing.len(),
            policy = %policy,
            "Resource manager initialized"
        );

        Ok(Self::new(node_id, total, unassigned, policy))
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the sink for status pushes; pushes are skipped until then
    pub fn attach_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        *self.scheduler.write().unwrap_or_else(|e| e.into_inner()) = Some(scheduler);
    }

    fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn total(&self) -> Limits {
        self.lock().total
    }

    pub fn unassigned(&self) -> Limits {
        self.lock().unassigned
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.lock().tasks.contains_key(task_id)
    }

    /// Live application ids
    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().app_ids.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Grant currently reserved for a task
    pub fn assigned(&self, task_id: &str) -> Option<Limits> {
        self.lock().assigned.get(task_id).copied()
    }

    pub fn layers(&self) -> Vec<String> {
        self.lock().layers.iter().cloned().collect()
    }

    fn publish_gauges(&self, state: &NodeState) {
        self.metrics.set_unassigned(&state.unassigned);
        self.metrics.set_running_tasks(state.tasks.len() as i64);
    }

    /// Reserve capacity for a task, returning the spec with the granted limits
    pub async fn request_resource(&self, spec: &ContainerSpec) -> Result<ContainerSpec> {
        let granted = {
            let mut state = self.lock();
            if state.assigned.contains_key(&spec.task_id) {
                return Err(CaptainError::InvalidTask {
                    task_id: spec.task_id.clone(),
                    reason: "task already holds a reservation".to_string(),
                });
            }

            let available = state.unassigned;
            let granted = if spec.limits.fits_within(&available) {
                spec.limits
            } else {
                match self.policy {
                    AdmissionPolicy::Clamp => spec.limits.clamp_to(&available),
                    AdmissionPolicy::Reject => {
                        drop(state);
                        self.metrics.inc_rejected();
                        return Err(CaptainError::InsufficientCapacity {
                            task_id: spec.task_id.clone(),
                            requested: spec.limits.to_string(),
                            unassigned: available.to_string(),
                        });
                    }
                }
            };

            state.unassigned.cpu_shares -= granted.cpu_shares;
            state.unassigned.memory_bytes -= granted.memory_bytes;
            state.assigned.insert(spec.task_id.clone(), granted);
            self.publish_gauges(&state);
            granted
        };

        self.metrics.inc_admitted(granted != spec.limits);
        self.logger
            .log_task_admitted(&spec.task_id, &spec.app_id, &spec.limits, &granted);

        self.push_best_effort().await;

        let mut admitted = spec.clone();
        admitted.limits = granted;
        Ok(admitted)
    }

    /// Return a task's reservation to the unassigned pool
    pub async fn release_resource(&self, spec: &ContainerSpec) {
        let released = {
            let mut state = self.lock();
            let released = state.release(&spec.task_id);
            self.publish_gauges(&state);
            released
        };

        match released {
            Some(limits) => debug!(task_id = %spec.task_id, released = %limits, "Reservation released"),
            None => debug!(task_id = %spec.task_id, "No reservation to release"),
        }

        self.push_best_effort().await;
    }

    /// Record a created container as a live task
    pub async fn append_task(&self, app_id: &str, task_id: &str, container: ContainerHandle) {
        {
            let mut state = self.lock();
            let previous = state.tasks.insert(
                task_id.to_string(),
                TaskRecord {
                    app_id: app_id.to_string(),
                    container,
                },
            );
            match previous {
                // Replaced under the same id; keep the app count as it was
                Some(old) if old.app_id == app_id => {}
                Some(old) => {
                    if let Some(count) = state.app_ids.get_mut(&old.app_id) {
                        *count -= 1;
                        if *count == 0 {
                            state.app_ids.remove(&old.app_id);
                        }
                    }
                    *state.app_ids.entry(app_id.to_string()).or_insert(0) += 1;
                }
                None => *state.app_ids.entry(app_id.to_string()).or_insert(0) += 1,
            }
            self.publish_gauges(&state);
        }

        debug!(task_id = %task_id, app_id = %app_id, "Task appended");
        self.push_best_effort().await;
    }

    /// Drop a task from the table without touching its reservation
    pub fn remove_task(&self, app_id: &str, task_id: &str) -> Option<TaskRecord> {
        let mut state = self.lock();
        let record = state.remove(app_id, task_id);
        self.publish_gauges(&state);
        record
    }

    /// Remove a task and release its reservation as one operation
    pub async fn retire_task(&self, app_id: &str, task_id: &str, spec: &ContainerSpec) -> Option<TaskRecord> {
        let record = {
            let mut state = self.lock();
            let record = state.remove(app_id, task_id);
            state.release(&spec.task_id);
            self.publish_gauges(&state);
            record
        };

        debug!(task_id = %task_id, app_id = %app_id, "Task retired");
        self.push_best_effort().await;
        record
    }

    /// Remember the image layers a pull reported as cached
    pub fn record_layers(&self, progress: &[PullProgress]) -> usize {
        let mut state = self.lock();
        let before = state.layers.len();
        state.layers.extend(
            progress
                .iter()
                .filter_map(PullProgress::cached_layer)
                .map(str::to_string),
        );
        let added = state.layers.len() - before;
        if added > 0 {
            debug!(added, total = state.layers.len(), "Recorded image layers");
        }
        added
    }

    /// Tracked tasks and their containers
    pub fn tracked_containers(&self) -> Vec<(String, ContainerHandle)> {
        self.lock()
            .tasks
            .iter()
            .map(|(task_id, record)| (task_id.clone(), record.container.clone()))
            .collect()
    }

    /// One sampling cycle: measure every tracked task and refresh active images
    ///
    /// Any measurement failure aborts the cycle without recording a sample.
    pub async fn sample_usage(&self, runtime: &dyn ContainerRuntime) -> Result<()> {
        let tracked = self.tracked_containers();

        let mut cpu = UsageSample::new();
        let mut memory = UsageSample::new();
        for (task_id, container) in &tracked {
            let usage = runtime.realtime_usage(&container.id).await?;
            cpu.record(task_id.as_str(), usage.cpu_percent);
            memory.record(task_id.as_str(), usage.memory_percent);
        }

        let active_images: Vec<String> = runtime
            .list(TASK_LABEL)
            .await?
            .into_iter()
            .map(|c| c.image)
            .collect();

        // One critical section so a snapshot never mixes cycles
        let mut state = self.lock();
        state.cpu_usage.push(cpu);
        state.memory_usage.push(memory);
        state.active_images = active_images;
        Ok(())
    }

    /// Look up the host port of every task that has none recorded yet
    pub async fn refresh_used_ports(&self, runtime: &dyn ContainerRuntime) {
        let pending: Vec<(String, ContainerHandle)> = {
            let state = self.lock();
            state
                .tasks
                .iter()
                .filter(|(task_id, _)| !state.used_ports.contains_key(*task_id))
                .map(|(task_id, record)| (task_id.clone(), record.container.clone()))
                .collect()
        };

        for (task_id, container) in pending {
            let port = match runtime.inspect(&container).await {
                Ok(details) => details.host_ports.into_iter().next().unwrap_or_default(),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Port lookup failed");
                    String::new()
                }
            };

            let mut state = self.lock();
            // The task may have finished while we were inspecting it
            if state.tasks.contains_key(&task_id) {
                state.used_ports.insert(task_id, port);
            }
        }
    }

    /// Consistent view of node state
    pub fn snapshot(&self) -> NodeStatus {
        let state = self.lock();

        let summary = |total: i64, unassigned: i64, history: &UsageHistory| ResourceSummary {
            total,
            unassigned,
            assigned: total - unassigned,
            available_percent: 100.0 - history.average(),
        };

        let mut app_ids: Vec<String> = state.app_ids.keys().cloned().collect();
        app_ids.sort();
        let mut task_ids: Vec<String> = state.tasks.keys().cloned().collect();
        task_ids.sort();

        NodeStatus {
            node_id: self.node_id.to_string(),
            cpu: summary(
                state.total.cpu_shares,
                state.unassigned.cpu_shares,
                &state.cpu_usage,
            ),
            memory: summary(
                state.total.memory_bytes,
                state.unassigned.memory_bytes,
                &state.memory_usage,
            ),
            app_ids,
            task_ids,
            used_ports: state.used_ports.clone(),
            task_usage: state.cpu_usage.most_recent().cloned().unwrap_or_default(),
            assigned_cpu: state
                .assigned
                .iter()
                .map(|(task_id, limits)| (task_id.clone(), limits.cpu_shares))
                .collect(),
            active_images: state.active_images.clone(),
            layers: state.layers.iter().cloned().collect(),
            generated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Send a snapshot to the attached scheduler
    ///
    /// Returns `Ok(false)` when no scheduler is attached yet.
    pub async fn send_status(&self) -> Result<bool> {
        let Some(scheduler) = self.scheduler() else {
            return Ok(false);
        };

        let status = self.snapshot().to_proto();
        match scheduler.update(status).await {
            Ok(()) => {
                self.metrics.inc_status_pushes();
                Ok(true)
            }
            Err(e) => {
                self.metrics.inc_status_push_failures();
                Err(CaptainError::StatusPush(e))
            }
        }
    }

    async fn push_best_effort(&self) {
        if let Err(e) = self.send_status().await {
            self.logger.log_status_push_failed(&e.to_string(), false);
        }
    }

    /// Stop, and optionally remove, every tracked container
    ///
    /// Failures are logged per container. Returns how many were stopped.
    pub async fn teardown(&self, runtime: &dyn ContainerRuntime, remove: bool) -> usize {
        let tracked = self.tracked_containers();
        let mut stopped = 0;

        for (task_id, container) in &tracked {
            match runtime.stop(container).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!(task_id = %task_id, container_id = %container.id, error = %e, "Failed to stop container"),
            }
            if remove {
                if let Err(e) = runtime.remove(container).await {
                    warn!(task_id = %task_id, container_id = %container.id, error = %e, "Failed to remove container");
                }
            }
        }

        info!(tracked = tracked.len(), stopped, removed = remove, "Tore down task containers");
        stopped
    }

    /// Release every outstanding reservation and clear the task table
    ///
    /// Returns the ids of the tasks that were still tracked.
    pub fn drain(&self) -> Vec<String> {
        let mut state = self.lock();

        let mut drained: Vec<String> = state.tasks.keys().cloned().collect();
        drained.sort();

        let reserved: Vec<String> = state.assigned.keys().cloned().collect();
        for task_id in &reserved {
            state.release(task_id);
        }
        state.tasks.clear();
        state.app_ids.clear();
        state.used_ports.clear();
        self.publish_gauges(&state);

        if !drained.is_empty() || !reserved.is_empty() {
            info!(
                tasks = drained.len(),
                reservations = reserved.len(),
                "Drained leftover tasks"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerDetails, HostCapacity};
    use crate::testing::{MockRuntime, MockScheduler};
    use std::collections::HashMap;

    fn spec(task_id: &str, app_id: &str, limits: Limits) -> ContainerSpec {
        ContainerSpec {
            task_id: task_id.to_string(),
            app_id: app_id.to_string(),
            image: "alpine:3".to_string(),
            command: vec![],
            env: vec![],
            port: None,
            requested: limits,
            limits,
            labels: HashMap::from([(TASK_LABEL.to_string(), task_id.to_string())]),
        }
    }

    fn handle(id: &str) -> ContainerHandle {
        ContainerHandle {
            id: id.to_string(),
            image: "alpine:3".to_string(),
        }
    }

    fn manager(total: Limits, policy: AdmissionPolicy) -> ResourceManager {
        ResourceManager::new(NodeId::from("node-1"), total, total, policy)
    }

    #[tokio::test]
    async fn test_initialize_subtracts_existing_containers() {
        let runtime = MockRuntime::new(HostCapacity {
            cpu_count: 8,
            memory_bytes: 16_000,
        })
        .with_existing(
            handle("old-1"),
            ContainerDetails {
                footprint: Limits::new(2, 4_000),
                host_ports: vec![],
            },
        );

        let rm = ResourceManager::initialize(NodeId::from("n"), &runtime, AdmissionPolicy::Clamp)
            .await
            .unwrap();
        assert_eq!(rm.total(), Limits::new(8, 16_000));
        assert_eq!(rm.unassigned(), Limits::new(6, 12_000));
    }

    #[tokio::test]
    async fn test_initialize_fails_without_capacity() {
        let runtime = MockRuntime::default().fail_capacity();
        let result =
            ResourceManager::initialize(NodeId::from("n"), &runtime, AdmissionPolicy::Clamp).await;
        assert!(matches!(result, Err(CaptainError::Capacity(_))));
    }

    #[tokio::test]
    async fn test_request_release_conserves_capacity() {
        let rm = manager(Limits::new(8, 1_000), AdmissionPolicy::Clamp);
        let specs = [
            spec("t1", "a", Limits::new(2, 100)),
            spec("t2", "a", Limits::new(3, 250)),
            spec("t3", "b", Limits::new(1, 50)),
        ];

        let mut admitted = Vec::new();
        for s in &specs {
            admitted.push(rm.request_resource(s).await.unwrap());
        }
        assert_eq!(rm.unassigned(), Limits::new(2, 600));

        // Release in a different order than admission
        for s in admitted.iter().rev() {
            rm.release_resource(s).await;
        }
        assert_eq!(rm.unassigned(), rm.total());
    }

    #[tokio::test]
    async fn test_request_is_clamped_to_remaining() {
        let rm = manager(Limits::new(4, 1_000), AdmissionPolicy::Clamp);
        rm.request_resource(&spec("t1", "a", Limits::new(3, 200)))
            .await
            .unwrap();

        let admitted = rm
            .request_resource(&spec("t2", "a", Limits::new(3, 200)))
            .await
            .unwrap();
        assert_eq!(admitted.limits, Limits::new(1, 200));
        assert_eq!(rm.unassigned(), Limits::new(0, 600));

        // Exhausted dimension grants zero, never negative
        let admitted = rm
            .request_resource(&spec("t3", "a", Limits::new(2, 100)))
            .await
            .unwrap();
        assert_eq!(admitted.limits, Limits::new(0, 100));
        assert_eq!(rm.unassigned().cpu_shares, 0);
    }

    #[tokio::test]
    async fn test_reject_policy_reserves_nothing() {
        let rm = manager(Limits::new(2, 1_000), AdmissionPolicy::Reject);
        let result = rm
            .request_resource(&spec("t1", "a", Limits::new(3, 10)))
            .await;

        assert!(matches!(
            result,
            Err(CaptainError::InsufficientCapacity { .. })
        ));
        assert_eq!(rm.unassigned(), Limits::new(2, 1_000));
        assert!(rm.assigned("t1").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_reservation_is_refused() {
        let rm = manager(Limits::new(4, 100), AdmissionPolicy::Clamp);
        let s = spec("t1", "a", Limits::new(1, 10));
        rm.request_resource(&s).await.unwrap();
        assert!(rm.request_resource(&s).await.is_err());
        assert_eq!(rm.unassigned(), Limits::new(3, 90));
    }

    #[tokio::test]
    async fn test_task_table_consistency() {
        let rm = manager(Limits::new(8, 1_000), AdmissionPolicy::Clamp);
        rm.append_task("app-a", "t1", handle("c1")).await;
        rm.append_task("app-a", "t2", handle("c2")).await;
        rm.append_task("app-b", "t3", handle("c3")).await;
        assert_eq!(rm.app_ids(), vec!["app-a", "app-b"]);

        // Another task of app-a is still running
        assert!(rm.remove_task("app-a", "t1").is_some());
        assert_eq!(rm.app_ids(), vec!["app-a", "app-b"]);

        rm.remove_task("app-a", "t2");
        assert_eq!(rm.app_ids(), vec!["app-b"]);
        assert!(rm.remove_task("app-a", "t2").is_none());

        let snapshot = rm.snapshot();
        assert_eq!(snapshot.task_ids, vec!["t3"]);
        assert_eq!(snapshot.app_ids, vec!["app-b"]);
    }

    #[tokio::test]
    async fn test_retire_removes_and_releases() {
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        let admitted = rm
            .request_resource(&spec("t1", "a", Limits::new(2, 100)))
            .await
            .unwrap();
        rm.append_task("a", "t1", handle("c1")).await;

        let record = rm.retire_task("a", "t1", &admitted).await;
        assert_eq!(record.map(|r| r.container.id), Some("c1".to_string()));
        assert_eq!(rm.unassigned(), rm.total());
        assert_eq!(rm.task_count(), 0);
        assert!(rm.app_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_is_safe() {
        let rm = Arc::new(manager(Limits::new(64, 64_000), AdmissionPolicy::Clamp));

        let mut handles = Vec::new();
        for i in 0..32 {
            let rm = rm.clone();
            handles.push(tokio::spawn(async move {
                let s = spec(&format!("t{}", i), "app", Limits::new(1, 1_000));
                let admitted = rm.request_resource(&s).await.unwrap();
                rm.append_task("app", &s.task_id, handle(&format!("c{}", i)))
                    .await;
                tokio::task::yield_now().await;
                rm.retire_task("app", &s.task_id, &admitted).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(rm.unassigned(), rm.total());
        assert_eq!(rm.task_count(), 0);
        assert!(rm.app_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_over_subscription_never_exceeds_capacity() {
        for policy in [AdmissionPolicy::Clamp, AdmissionPolicy::Reject] {
            let rm = Arc::new(manager(Limits::new(10, 1_000), policy));

            let mut handles = Vec::new();
            for i in 0..50 {
                let rm = rm.clone();
                handles.push(tokio::spawn(async move {
                    let s = spec(&format!("t{}", i), "app", Limits::new(3, 300));
                    rm.request_resource(&s).await.ok().map(|admitted| admitted.limits)
                }));
            }

            let mut granted = Limits::default();
            for h in handles {
                if let Some(limits) = h.await.unwrap() {
                    granted.cpu_shares += limits.cpu_shares;
                    granted.memory_bytes += limits.memory_bytes;
                }
            }

            let total = rm.total();
            let unassigned = rm.unassigned();
            assert!(granted.fits_within(&total), "{:?} granted {}", policy, granted);
            assert!(unassigned.cpu_shares >= 0 && unassigned.memory_bytes >= 0);
            assert_eq!(unassigned.cpu_shares, total.cpu_shares - granted.cpu_shares);
            assert_eq!(unassigned.memory_bytes, total.memory_bytes - granted.memory_bytes);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshot_sees_whole_sampling_cycles() {
        let rm = Arc::new(manager(Limits::new(4, 400), AdmissionPolicy::Clamp));
        rm.append_task("a", "t1", handle("c1")).await;

        // Each runtime reports the same CPU and memory figure, so any snapshot
        // must show matching CPU and memory availability
        let sampler = {
            let rm = rm.clone();
            tokio::spawn(async move {
                let low = MockRuntime::default().with_usage(10.0, 10.0);
                let high = MockRuntime::default().with_usage(70.0, 70.0);
                for i in 0..200 {
                    let runtime = if i % 2 == 0 { &low } else { &high };
                    rm.sample_usage(runtime).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        while !sampler.is_finished() {
            let snapshot = rm.snapshot();
            assert_eq!(
                snapshot.cpu.available_percent,
                snapshot.memory.available_percent
            );
            tokio::task::yield_now().await;
        }
        sampler.await.unwrap();
    }

    #[tokio::test]
    async fn test_pushes_after_mutations() {
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);

        // Nothing attached: no push, no error
        assert!(!rm.send_status().await.unwrap());

        let (scheduler, _tasks) = MockScheduler::new();
        rm.attach_scheduler(scheduler.clone());

        let admitted = rm
            .request_resource(&spec("t1", "a", Limits::new(1, 100)))
            .await
            .unwrap();
        rm.append_task("a", "t1", handle("c1")).await;
        rm.release_resource(&admitted).await;
        assert_eq!(scheduler.update_count(), 3);

        let last = scheduler.last_update().unwrap();
        assert_eq!(last.task_ids, vec!["t1"]);
        assert_eq!(last.host_resource["CPU"].unassigned, 4);
    }

    #[tokio::test]
    async fn test_push_failure_does_not_fail_admission() {
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        let (scheduler, _tasks) = MockScheduler::new();
        scheduler.fail_updates(true);
        rm.attach_scheduler(scheduler.clone());

        let admitted = rm
            .request_resource(&spec("t1", "a", Limits::new(1, 100)))
            .await;
        assert!(admitted.is_ok());
        assert!(matches!(
            rm.send_status().await,
            Err(CaptainError::StatusPush(_))
        ));
    }

    #[tokio::test]
    async fn test_record_layers() {
        let rm = manager(Limits::new(1, 1), AdmissionPolicy::Clamp);
        let progress = vec![
            PullProgress::new("latest", "Pulling from library/alpine"),
            PullProgress::new("l1", "Pulling fs layer"),
            PullProgress::new("l2", "Already exists"),
            PullProgress::new("l3", "Downloading"),
            PullProgress::default(),
        ];
        assert_eq!(rm.record_layers(&progress), 2);
        assert_eq!(rm.record_layers(&progress), 0);
        assert_eq!(rm.layers(), vec!["l1", "l2"]);
    }

    #[tokio::test]
    async fn test_sample_usage_feeds_snapshot() {
        let runtime = MockRuntime::default().with_usage(25.0, 50.0);
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        rm.append_task("a", "t1", handle("c1")).await;
        rm.append_task("a", "t2", handle("c2")).await;

        rm.sample_usage(&runtime).await.unwrap();

        let snapshot = rm.snapshot();
        assert_eq!(snapshot.task_usage.len(), 2);
        assert_eq!(snapshot.task_usage["t1"], 25.0);
        assert!((snapshot.cpu.available_percent - 50.0).abs() < 1e-9);
        assert!((snapshot.memory.available_percent - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sample_failure_aborts_cycle() {
        let runtime = MockRuntime::default().fail_usage();
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        rm.append_task("a", "t1", handle("c1")).await;

        assert!(rm.sample_usage(&runtime).await.is_err());
        let snapshot = rm.snapshot();
        assert!(snapshot.task_usage.is_empty());
        assert_eq!(snapshot.cpu.available_percent, 100.0);
    }

    #[tokio::test]
    async fn test_refresh_used_ports() {
        let runtime = MockRuntime::default().with_existing(
            handle("c1"),
            ContainerDetails {
                footprint: Limits::default(),
                host_ports: vec!["49153".to_string(), "49154".to_string()],
            },
        );
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        rm.append_task("a", "t1", handle("c1")).await;
        // Unknown to the runtime: inspection fails
        rm.append_task("a", "t2", handle("missing")).await;

        rm.refresh_used_ports(&runtime).await;

        let ports = rm.snapshot().used_ports;
        assert_eq!(ports["t1"], "49153");
        assert_eq!(ports["t2"], "");
    }

    #[tokio::test]
    async fn test_drain_releases_everything() {
        let rm = manager(Limits::new(4, 400), AdmissionPolicy::Clamp);
        rm.request_resource(&spec("t1", "a", Limits::new(1, 100)))
            .await
            .unwrap();
        rm.append_task("a", "t1", handle("c1")).await;
        // Admitted but never appended
        rm.request_resource(&spec("t2", "a", Limits::new(1, 100)))
            .await
            .unwrap();

        assert_eq!(rm.drain(), vec!["t1"]);
        assert_eq!(rm.unassigned(), rm.total());
        assert_eq!(rm.task_count(), 0);
        assert!(rm.app_ids().is_empty());
    }

    #[test]
    fn test_admission_policy_parse() {
        assert_eq!("clamp".parse::<AdmissionPolicy>(), Ok(AdmissionPolicy::Clamp));
        assert_eq!("REJECT".parse::<AdmissionPolicy>(), Ok(AdmissionPolicy::Reject));
        assert!("maybe".parse::<AdmissionPolicy>().is_err());
        assert_eq!(AdmissionPolicy::default(), AdmissionPolicy::Clamp);
    }
}
