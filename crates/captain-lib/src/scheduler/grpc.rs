//! gRPC client for the spinner service
//!
//! One channel is established up front and shared by every call. There is no
//! reconnect: a broken channel surfaces as a stream or call error and ends the
//! session.

use super::{Scheduler, TaskStream};
use crate::error::{CaptainError, Result};
use crate::proto::{JoinRequest, NodeInfo, SpinnerClient, TaskLog};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

/// Buffered log chunks per task before the executor waits on the stream
const TASK_LOG_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Spinner URL (e.g. "http://spinner:50051")
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| self.connect_error(e))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(self.connect_error(format!("unsupported scheme {}", other))),
        }
        if url.host_str().is_none() {
            return Err(self.connect_error("no host in endpoint URL"));
        }
        Ok(())
    }

    fn connect_error(&self, reason: impl ToString) -> CaptainError {
        CaptainError::Connect {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Spinner client over a single tonic channel
#[derive(Clone)]
pub struct GrpcScheduler {
    client: SpinnerClient<Channel>,
    endpoint: String,
}

impl GrpcScheduler {
    /// Establish the channel to the spinner
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let channel = Channel::from_shared(config.endpoint.clone())
            .map_err(|e| config.connect_error(e))?
            .connect_timeout(config.connect_timeout)
            .http2_keep_alive_interval(config.keepalive_interval)
            .keep_alive_timeout(config.keepalive_timeout)
            .keep_alive_while_idle(true)
            .connect()
            .await
            .map_err(|e| config.connect_error(e))?;

        info!(endpoint = %config.endpoint, "Connected to spinner");

        Ok(Self {
            client: SpinnerClient::new(channel),
            endpoint: config.endpoint,
        })
    }
}

#[async_trait]
impl Scheduler for GrpcScheduler {
    async fn attach(&self, request: JoinRequest) -> std::result::Result<TaskStream, tonic::Status> {
        let mut client = self.client.clone();
        let stream = client.attach(request).await?.into_inner();
        Ok(stream.boxed())
    }

    async fn open_task_log(&self) -> std::result::Result<mpsc::Sender<TaskLog>, tonic::Status> {
        let (tx, rx) = mpsc::channel(TASK_LOG_BUFFER);
        let mut client = self.client.clone();
        let endpoint = self.endpoint.clone();

        // The call completes once the executor drops its sender
        tokio::spawn(async move {
            match client.run(ReceiverStream::new(rx)).await {
                Ok(response) => {
                    let response = response.into_inner();
                    debug!(
                        success = response.success,
                        message = %response.message,
                        "Task log stream closed"
                    );
                }
                Err(status) => {
                    warn!(endpoint = %endpoint, error = %status, "Task log stream failed");
                }
            }
        });

        Ok(tx)
    }

    async fn update(&self, status: NodeInfo) -> std::result::Result<(), tonic::Status> {
        let mut client = self.client.clone();
        let response = client.update(status).await?.into_inner();
        if !response.success {
            debug!(
                endpoint = %self.endpoint,
                message = %response.message,
                "Spinner did not accept status update"
            );
        }
        Ok(())
    }
}
