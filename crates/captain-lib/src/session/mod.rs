//! Session with the spinner
//!
//! A [`Session`] drives the node through
//! `Disconnected → Connecting → Attached → Streaming → Draining → Closed`:
//! it registers the node, spawns one executor per received task, runs the
//! sampling and reporting loops, and on any exit tears down so that no
//! container is orphaned and no reservation outlives the session.

mod geo;

pub use geo::{Coordinates, Geolocator, LocationHint, StaticGeolocator};

use crate::error::{CaptainError, Result};
use crate::executor::{TaskExecutor, TaskOutcome};
use crate::health::{components, HealthRegistry};
use crate::observability::StructuredLogger;
use crate::proto::{JoinRequest, NodeRole, Uuid};
use crate::resource::{LoopConfig, ReportingLoop, ResourceManager, SamplingLoop};
use crate::runtime::ContainerRuntime;
use crate::scheduler::{ClientConfig, GrpcScheduler, Scheduler};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Attached,
    Streaming,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Attached => "attached",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How this node presents itself when joining
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub role: NodeRole,
    pub tags: Vec<String>,
    /// Address the spinner and other nodes reach this node at
    pub address: String,
    /// Advisory; logged on attach, not sent to the spinner
    pub location: LocationHint,
}

impl NodeRegistration {
    pub fn new(role: NodeRole, address: impl Into<String>) -> Self {
        Self {
            role,
            tags: Vec::new(),
            address: address.into(),
            location: LocationHint::default(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_location(mut self, location: LocationHint) -> Self {
        self.location = location;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub loops: LoopConfig,
    /// How long executors may run on after the session starts draining
    /// before their containers are stopped (default: 30 seconds)
    pub drain_timeout: Duration,
    /// Upper bound on executors running at once; unbounded when `None`
    pub max_concurrent_tasks: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loops: LoopConfig::default(),
            drain_timeout: Duration::from_secs(30),
            max_concurrent_tasks: None,
        }
    }
}

enum SchedulerSource {
    Endpoint(ClientConfig),
    Connected(Arc<dyn Scheduler>),
}

/// Why the streaming phase ended
enum Exit {
    Interrupted,
    EndOfStream,
    Receive(tonic::Status),
    LogStream(tonic::Status),
    Reporter(std::result::Result<Result<()>, JoinError>),
}

impl Exit {
    fn describe(&self) -> String {
        match self {
            Exit::Interrupted => "interrupted".to_string(),
            Exit::EndOfStream => "task stream ended".to_string(),
            Exit::Receive(status) => format!("task stream failed: {}", status.message()),
            Exit::LogStream(status) => format!("task log stream failed: {}", status.message()),
            Exit::Reporter(_) => "status reporting failed".to_string(),
        }
    }

    fn into_result(self) -> Result<()> {
        match self {
            Exit::Interrupted | Exit::EndOfStream => Ok(()),
            Exit::Receive(status) => Err(CaptainError::Receive(status)),
            Exit::LogStream(status) => Err(CaptainError::LogStream(status)),
            Exit::Reporter(Ok(result)) => result,
            Exit::Reporter(Err(e)) => Err(CaptainError::Join(e)),
        }
    }
}

pub struct Session {
    manager: Arc<ResourceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    scheduler: SchedulerSource,
    geolocator: Arc<dyn Geolocator>,
    registration: NodeRegistration,
    config: SessionConfig,
    health: HealthRegistry,
    state: watch::Sender<SessionState>,
    logger: StructuredLogger,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "Session state changed");
    }

    /// Run until the task stream ends, fails, or the process is interrupted
    pub async fn run(&self) -> Result<()> {
        self.run_until(interrupt_signal()).await
    }

    /// Run until the task stream ends, fails, or `interrupt` resolves
    pub async fn run_until<F>(&self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let scheduler = match self.establish().await {
            Ok(scheduler) => scheduler,
            Err(e) => return Err(self.abort(e).await),
        };
        self.manager.attach_scheduler(scheduler.clone());

        let coordinates = self
            .geolocator
            .locate(&self.registration.address)
            .await;
        let request = JoinRequest {
            captain_id: Some(Uuid::from(self.manager.node_id().as_str())),
            ip: self.registration.address.clone(),
            lat: coordinates.latitude,
            lon: coordinates.longitude,
            role: self.registration.role as i32,
            tags: self.registration.tags.clone(),
        };

        let mut tasks = match scheduler.attach(request).await {
            Ok(stream) => stream,
            Err(status) => return Err(self.abort(CaptainError::Attach(status)).await),
        };
        self.transition(SessionState::Attached);
        info!(
            node_id = %self.manager.node_id(),
            role = self.registration.role.as_str_name(),
            tags = ?self.registration.tags,
            location = %self.registration.location,
            latitude = coordinates.latitude,
            longitude = coordinates.longitude,
            "Attached to spinner"
        );
        self.health.set_healthy(components::SESSION).await;
        self.health.set_ready(true).await;

        // Loops stop on `shutdown`; executors abandon unstarted work on `cancel`
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sampler = SamplingLoop::new(
            self.manager.clone(),
            self.runtime.clone(),
            self.config.loops.sample_interval,
        )
        .with_health(self.health.clone());
        let reporter = ReportingLoop::new(
            self.manager.clone(),
            self.runtime.clone(),
            self.config.loops.report_interval,
        )
        .with_health(self.health.clone());
        let sampler_handle = tokio::spawn(sampler.run(shutdown_rx.clone()));
        let mut reporter_handle = tokio::spawn(reporter.run(shutdown_rx.clone()));

        self.transition(SessionState::Streaming);

        let limiter = self
            .config
            .max_concurrent_tasks
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut executors: JoinSet<TaskOutcome> = JoinSet::new();
        let mut received = 0u64;
        tokio::pin!(interrupt);

        let exit = loop {
            tokio::select! {
                _ = &mut interrupt => break Exit::Interrupted,
                result = &mut reporter_handle => break Exit::Reporter(result),
                Some(joined) = executors.join_next(), if !executors.is_empty() => {
                    log_joined(joined);
                }
                next = tasks.next() => match next {
                    None => break Exit::EndOfStream,
                    Some(Err(status)) => break Exit::Receive(status),
                    Some(Ok(task)) => {
                        received += 1;
                        debug!(task_id = %task.task_id_value(), image = %task.image, "Task received");

                        let log = match scheduler.open_task_log().await {
                            Ok(log) => log,
                            Err(status) => break Exit::LogStream(status),
                        };

                        let executor = TaskExecutor::new(
                            self.manager.clone(),
                            self.runtime.clone(),
                            cancel_rx.clone(),
                        );
                        let limiter = limiter.clone();
                        let cancelled = cancel_rx.clone();
                        executors.spawn(async move {
                            // Held for the whole execution
                            let _permit = match limiter {
                                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                                None => None,
                            };
                            if *cancelled.borrow() {
                                return TaskOutcome::Cancelled;
                            }
                            executor.execute(task, log).await
                        });
                    }
                },
            }
        };

        let reporter_finished = matches!(exit, Exit::Reporter(_));
        let reason = exit.describe();
        match &exit {
            Exit::Interrupted | Exit::EndOfStream => info!(reason = %reason, received, "Session ending"),
            _ => error!(reason = %reason, received, "Session ending"),
        }

        let interrupted = matches!(exit, Exit::Interrupted);
        self.drain(
            &shutdown_tx,
            &cancel_tx,
            interrupted || reporter_finished,
            interrupted,
            &mut executors,
        )
        .await;

        // Background loops stop on the shutdown signal
        if let Err(e) = sampler_handle.await {
            warn!(error = %e, "Sampling loop panicked");
        }
        if !reporter_finished {
            match reporter_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Reporting loop failed while draining"),
                Err(e) => warn!(error = %e, "Reporting loop panicked"),
            }
        }

        let leftover = self.manager.drain();
        if !leftover.is_empty() {
            warn!(tasks = ?leftover, "Released reservations of tasks still tracked at close");
        }

        self.transition(SessionState::Closed);
        self.health.set_ready(false).await;
        let result = exit.into_result();
        match &result {
            Ok(()) => self.health.set_healthy(components::SESSION).await,
            Err(e) => self.health.set_unhealthy(components::SESSION, e.to_string()).await,
        }
        self.logger.log_shutdown(&reason);
        result
    }

    async fn establish(&self) -> Result<Arc<dyn Scheduler>> {
        match &self.scheduler {
            SchedulerSource::Connected(scheduler) => Ok(scheduler.clone()),
            SchedulerSource::Endpoint(config) => {
                self.transition(SessionState::Connecting);
                let scheduler = GrpcScheduler::connect(config.clone()).await?;
                Ok(Arc::new(scheduler))
            }
        }
    }

    /// Fail before streaming started; nothing to tear down yet
    async fn abort(&self, error: CaptainError) -> CaptainError {
        self.transition(SessionState::Closed);
        self.health
            .set_unhealthy(components::SESSION, error.to_string())
            .await;
        self.logger.log_shutdown(&error.to_string());
        error
    }

    /// Stop accepting work, let executors finish, then stop what is left
    ///
    /// With `cancel_now`, executors that have not started their container
    /// give up at once; otherwise every received task gets to run until the
    /// drain timeout. With `remove`, containers are removed up front.
    async fn drain(
        &self,
        shutdown: &watch::Sender<bool>,
        cancel: &watch::Sender<bool>,
        cancel_now: bool,
        remove: bool,
        executors: &mut JoinSet<TaskOutcome>,
    ) {
        self.transition(SessionState::Draining);
        self.health.set_ready(false).await;
        shutdown.send_replace(true);

        if cancel_now {
            cancel.send_replace(true);
        }
        if remove {
            self.manager.teardown(self.runtime.as_ref(), true).await;
        }

        let pending = executors.len();
        let finished = tokio::time::timeout(self.config.drain_timeout, join_all(executors)).await;
        if finished.is_err() {
            warn!(
                pending,
                still_running = executors.len(),
                timeout_secs = self.config.drain_timeout.as_secs(),
                "Executors still running after drain timeout, stopping containers"
            );
        }

        cancel.send_replace(true);
        // Stopped, not removed: their logs stay inspectable
        self.manager.teardown(self.runtime.as_ref(), false).await;
        join_all(executors).await;
    }
}

async fn join_all(executors: &mut JoinSet<TaskOutcome>) {
    while let Some(joined) = executors.join_next().await {
        log_joined(joined);
    }
}

fn log_joined(joined: std::result::Result<TaskOutcome, JoinError>) {
    match joined {
        Ok(outcome) => debug!(outcome = %outcome, "Executor finished"),
        Err(e) => error!(error = %e, "Executor panicked"),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Builder for a [`Session`]
pub struct SessionBuilder {
    manager: Option<Arc<ResourceManager>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    scheduler: Option<SchedulerSource>,
    geolocator: Arc<dyn Geolocator>,
    registration: Option<NodeRegistration>,
    config: SessionConfig,
    health: HealthRegistry,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            manager: None,
            runtime: None,
            scheduler: None,
            geolocator: Arc::new(StaticGeolocator::default()),
            registration: None,
            config: SessionConfig::default(),
            health: HealthRegistry::new(),
        }
    }

    pub fn manager(mut self, manager: Arc<ResourceManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Connect to the spinner at this endpoint when the session runs
    pub fn endpoint(mut self, config: ClientConfig) -> Self {
        self.scheduler = Some(SchedulerSource::Endpoint(config));
        self
    }

    /// Use an already connected scheduler
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(SchedulerSource::Connected(scheduler));
        self
    }

    pub fn geolocator(mut self, geolocator: Arc<dyn Geolocator>) -> Self {
        self.geolocator = geolocator;
        self
    }

    pub fn registration(mut self, registration: NodeRegistration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> anyhow::Result<Session> {
        let manager = self
            .manager
            .ok_or_else(|| anyhow::anyhow!("Resource manager is required"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| anyhow::anyhow!("Container runtime is required"))?;
        let scheduler = self
            .scheduler
            .ok_or_else(|| anyhow::anyhow!("Scheduler or spinner endpoint is required"))?;
        let registration = self
            .registration
            .ok_or_else(|| anyhow::anyhow!("Node registration is required"))?;

        if self.config.loops.sample_interval.is_zero() || self.config.loops.report_interval.is_zero() {
            return Err(anyhow::anyhow!("Loop intervals must be non-zero"));
        }
        if self.config.max_concurrent_tasks == Some(0) {
            return Err(anyhow::anyhow!("max_concurrent_tasks must be at least 1"));
        }

        let logger = StructuredLogger::new(manager.node_id().as_str());
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Session {
            manager,
            runtime,
            scheduler,
            geolocator: self.geolocator,
            registration,
            config: self.config,
            health: self.health,
            state,
            logger,
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
