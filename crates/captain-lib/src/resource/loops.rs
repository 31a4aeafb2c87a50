//! Background loops of the resource manager
//!
//! The sampling loop measures live utilization of tracked tasks on a fixed
//! interval. The reporting loop sends a full node status to the scheduler and
//! is the session's liveness check: a failed push ends the session.

use super::ResourceManager;
use crate::error::{CaptainError, Result};
use crate::health::{components, HealthRegistry};
use crate::observability::{CaptainMetrics, StructuredLogger};
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Time between sampling cycles (default: 1 second)
    pub sample_interval: Duration,
    /// Time between status reports (default: 5 seconds)
    pub report_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(5),
        }
    }
}

/// Resolves once shutdown has been signalled or the sender is gone
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub struct SamplingLoop {
    manager: Arc<ResourceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    health: Option<HealthRegistry>,
    metrics: CaptainMetrics,
}

impl SamplingLoop {
    pub fn new(
        manager: Arc<ResourceManager>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            runtime,
            interval,
            health: None,
            metrics: CaptainMetrics::new(),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Sample until shutdown; a failed cycle is reported and skipped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting usage sampling loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let result = self.manager.sample_usage(self.runtime.as_ref()).await;
                    self.metrics.observe_sampling_latency(start.elapsed().as_secs_f64());
                    cycles += 1;

                    match result {
                        Ok(()) => {
                            if let Some(health) = &self.health {
                                health.set_healthy(components::SAMPLER).await;
                            }
                        }
                        Err(e) => {
                            self.metrics.inc_sampling_errors();
                            warn!(error = %e, cycle = cycles, "Sampling cycle aborted");
                            if let Some(health) = &self.health {
                                health.set_degraded(components::SAMPLER, e.to_string()).await;
                            }
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!(cycles, "Shutting down usage sampling loop");
                    break;
                }
            }
        }
    }
}

pub struct ReportingLoop {
    manager: Arc<ResourceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

impl ReportingLoop {
    pub fn new(
        manager: Arc<ResourceManager>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        let logger = StructuredLogger::new(manager.node_id().as_str());
        Self {
            manager,
            runtime,
            interval,
            health: None,
            logger,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Report until shutdown
    ///
    /// A failed push stops and removes every tracked container and returns
    /// [`CaptainError::StatusPush`].
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting status reporting loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; leave the sampler a head start
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.manager.refresh_used_ports(self.runtime.as_ref()).await;

                    match self.manager.send_status().await {
                        Ok(sent) => {
                            debug!(sent, "Status report cycle complete");
                            if let Some(health) = &self.health {
                                health.set_healthy(components::REPORTER).await;
                            }
                        }
                        Err(e) => return Err(self.fail(e).await),
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("Shutting down status reporting loop");
                    return Ok(());
                }
            }
        }
    }

    async fn fail(&self, error: CaptainError) -> CaptainError {
        self.logger.log_status_push_failed(&error.to_string(), true);
        if let Some(health) = &self.health {
            health
                .set_unhealthy(components::REPORTER, error.to_string())
                .await;
        }
        self.manager.teardown(self.runtime.as_ref(), true).await;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerHandle, Limits, NodeId};
    use crate::resource::AdmissionPolicy;
    use crate::testing::{MockRuntime, MockScheduler};

    fn manager() -> Arc<ResourceManager> {
        let total = Limits::new(4, 4_000);
        Arc::new(ResourceManager::new(
            NodeId::from("node-1"),
            total,
            total,
            AdmissionPolicy::Clamp,
        ))
    }

    #[test]
    fn test_loop_config_default() {
        let config = LoopConfig::default();
        assert_eq!(config.sample_interval, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sampling_loop_stops_on_shutdown() {
        let rm = manager();
        rm.append_task("a", "t1", ContainerHandle { id: "c1".into(), image: "img".into() })
            .await;
        let runtime = Arc::new(MockRuntime::default().with_usage(10.0, 5.0));
        let sampler = SamplingLoop::new(rm.clone(), runtime, Duration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sampler.run(rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rm.snapshot().task_usage["t1"], 10.0);
    }

    #[tokio::test]
    async fn test_reporting_loop_pushes_status() {
        let rm = manager();
        let (scheduler, _tasks) = MockScheduler::new();
        rm.attach_scheduler(scheduler.clone());
        let runtime = Arc::new(MockRuntime::default());
        let reporter = ReportingLoop::new(rm, runtime, Duration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reporter.run(rx));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
        assert!(scheduler.update_count() >= 2);
    }

    #[tokio::test]
    async fn test_reporting_failure_tears_down() {
        let rm = manager();
        let (scheduler, _tasks) = MockScheduler::new();
        scheduler.fail_updates(true);
        rm.attach_scheduler(scheduler);

        let runtime = Arc::new(MockRuntime::default());
        let container = runtime.spawn_container("img");
        rm.append_task("a", "t1", container).await;

        let health = HealthRegistry::new();
        let reporter = ReportingLoop::new(rm, runtime.clone(), Duration::from_millis(10))
            .with_health(health.clone());

        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(1), reporter.run(rx))
            .await
            .unwrap();

        assert!(matches!(result, Err(CaptainError::StatusPush(_))));
        assert_eq!(runtime.stop_count(), 1);
        assert_eq!(runtime.remove_count(), 1);
        assert_eq!(
            health.status_of(components::REPORTER).await,
            Some(crate::health::ComponentStatus::Unhealthy)
        );
    }
}
