//! Captain - node agent for the volunteer-compute fleet
//!
//! Attaches to the spinner, runs the tasks it hands out as Docker
//! containers and reports node status until the stream ends or the
//! process is signalled.

use anyhow::{Context, Result};
use captain::{api, config};
use captain_lib::{
    health::{components, HealthRegistry},
    observability::{CaptainMetrics, StructuredLogger},
    proto::NodeRole,
    ClientConfig, DockerRuntime, LoopConfig, NodeId, NodeRegistration, ResourceManager, Session,
    SessionConfig, StaticGeolocator,
};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CAPTAIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = config::Args::parse();
    let config = config::AgentConfig::load()?;
    let role = NodeRole::from(args.role);
    info!(
        spinner = %args.spinner,
        role = role.as_str_name(),
        location = %args.location,
        tags = ?args.tags,
        "Starting captain"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let runtime = match DockerRuntime::connect().await {
        Ok(runtime) => {
            health_registry.set_healthy(components::RUNTIME).await;
            Arc::new(runtime)
        }
        Err(e) => {
            error!(error = %e, "Docker is unavailable");
            return Err(e).context("Failed to connect to Docker");
        }
    };

    let node_id = NodeId::generate();
    let manager = Arc::new(
        ResourceManager::initialize(node_id.clone(), runtime.as_ref(), config.admission_policy)
            .await
            .context("Failed to determine host capacity")?,
    );

    let metrics = CaptainMetrics::new();
    metrics.set_unassigned(&manager.unassigned());

    let logger = StructuredLogger::new(node_id.as_str());
    logger.log_startup(CAPTAIN_VERSION, role.as_str_name(), &manager.total());

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        manager.clone(),
    ));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server stopped");
        }
    });

    let session = Session::builder()
        .manager(manager)
        .runtime(runtime)
        .endpoint(
            ClientConfig::new(args.spinner.as_str()).connect_timeout(config.connect_timeout()),
        )
        .geolocator(Arc::new(StaticGeolocator::new(config.coordinates())))
        .registration(
            NodeRegistration::new(role, args.local_address.to_string())
                .with_tags(args.tags)
                .with_location(args.location),
        )
        .config(SessionConfig {
            loops: LoopConfig {
                sample_interval: config.sample_interval(),
                report_interval: config.report_interval(),
            },
            drain_timeout: config.drain_timeout(),
            max_concurrent_tasks: config.max_concurrent_tasks,
        })
        .health(health_registry)
        .build()?;

    session.run().await.context("Session with spinner failed")?;

    info!("Shutting down");
    Ok(())
}
