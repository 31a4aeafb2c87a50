//! Docker implementation of the container runtime
//!
//! Thin adapter over the Docker Engine API via `bollard`. Containers are
//! labelled with [`TASK_LABEL`](crate::models::TASK_LABEL) so the agent can
//! find its own containers.

use super::{
    ContainerDetails, ContainerRuntime, ContainerUsage, HostCapacity, LogStream, PullProgress,
    RuntimeError, RuntimeResult,
};
use crate::models::{ContainerHandle, ContainerSpec, Limits};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{CreateImageInfo, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Docker treats smaller share values as 2
const MIN_CPU_SHARES: i64 = 2;
/// Smallest memory limit the daemon accepts
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

/// Limit to enforce for one dimension
///
/// A zero grant against a non-zero request still gets the smallest limit
/// Docker enforces; zero would mean "unlimited" to the daemon.
fn enforced_limit(granted: i64, requested: i64, minimum: i64) -> Option<i64> {
    if granted > 0 {
        Some(granted.max(minimum))
    } else if requested > 0 {
        Some(minimum)
    } else {
        None
    }
}

/// One pull stream item; entries the client cannot decode are skipped
fn pull_record(
    item: Result<CreateImageInfo, BollardError>,
) -> RuntimeResult<Option<PullProgress>> {
    match item {
        Ok(info) => Ok(Some(info.into())),
        Err(e @ (BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. })) => {
            debug!(error = %e, "Skipping malformed pull progress entry");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub async fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        info!("Connected to Docker daemon");
        Ok(Self::new(docker))
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut host_config = HostConfig {
            cpu_shares: enforced_limit(
                spec.limits.cpu_shares,
                spec.requested.cpu_shares,
                MIN_CPU_SHARES,
            ),
            memory: enforced_limit(
                spec.limits.memory_bytes,
                spec.requested.memory_bytes,
                MIN_MEMORY_BYTES,
            ),
            ..Default::default()
        };

        let mut exposed_ports = None;
        if let Some(port) = spec.port {
            let key = format!("{}/tcp", port);
            // No host port: the daemon binds a free ephemeral one
            host_config.port_bindings = Some(HashMap::from([(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: None,
                }]),
            )]));
            exposed_ports = Some(HashMap::from([(key, HashMap::new())]));
        }

        Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn host_capacity(&self) -> RuntimeResult<HostCapacity> {
        let info = self.docker.info().await?;
        match (info.ncpu, info.mem_total) {
            (Some(cpu_count), Some(memory_bytes)) => Ok(HostCapacity {
                cpu_count,
                memory_bytes,
            }),
            _ => Err(RuntimeError::Unavailable(
                "daemon did not report CPU count and total memory".to_string(),
            )),
        }
    }

    async fn list(&self, label: &str) -> RuntimeResult<Vec<ContainerHandle>> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerHandle {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect(&self, container: &ContainerHandle) -> RuntimeResult<ContainerDetails> {
        let resp = self
            .docker
            .inspect_container(&container.id, None::<InspectContainerOptions>)
            .await?;

        let footprint = resp
            .host_config
            .map(|hc| Limits::new(hc.cpu_shares.unwrap_or(0), hc.memory.unwrap_or(0)))
            .unwrap_or_default();

        let host_ports = resp
            .network_settings
            .and_then(|ns| ns.ports)
            .map(|ports| {
                ports
                    .into_values()
                    .flatten()
                    .flatten()
                    .filter_map(|binding| binding.host_port)
                    .filter(|port| !port.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ContainerDetails {
            footprint,
            host_ports,
        })
    }

    async fn pull(&self, image: &str) -> RuntimeResult<Vec<PullProgress>> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        let mut progress = Vec::new();
        while let Some(item) = stream.next().await {
            if let Some(record) = pull_record(item)? {
                progress.push(record);
            }
        }

        debug!(image = %image, records = progress.len(), "Image pulled");
        Ok(progress)
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle> {
        let resp = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                Self::container_config(spec),
            )
            .await?;

        for warning in &resp.warnings {
            debug!(task_id = %spec.task_id, warning = %warning, "Container create warning");
        }

        Ok(ContainerHandle {
            id: resp.id,
            image: spec.image.clone(),
        })
    }

    async fn run(&self, container: &ContainerHandle) -> RuntimeResult<LogStream> {
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await?;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&container.id, Some(options))
            .map(|item| item.map(|output| output.to_string()).map_err(RuntimeError::from));

        Ok(stream.boxed())
    }

    async fn stop(&self, container: &ContainerHandle) -> RuntimeResult<()> {
        self.docker
            .stop_container(&container.id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, container: &ContainerHandle) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&container.id, Some(options))
            .await?;
        Ok(())
    }

    async fn realtime_usage(&self, container_id: &str) -> RuntimeResult<ContainerUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let stats = self
            .docker
            .stats(container_id, Some(options))
            .next()
            .await
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))??;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
                .unwrap_or(1)
        });

        Ok(ContainerUsage {
            cpu_percent: cpu_percent(cpu_delta as f64, system_delta as f64, cpus as f64),
            memory_percent: memory_percent(
                stats.memory_stats.usage.unwrap_or(0) as f64,
                stats.memory_stats.limit.unwrap_or(0) as f64,
            ),
        })
    }
}

/// CPU utilization the way `docker stats` reports it
fn cpu_percent(cpu_delta: f64, system_delta: f64, cpus: f64) -> f64 {
    if cpu_delta > 0.0 && system_delta > 0.0 {
        cpu_delta / system_delta * cpus * 100.0
    } else {
        0.0
    }
}

fn memory_percent(usage: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        usage / limit * 100.0
    } else {
        0.0
    }
}
