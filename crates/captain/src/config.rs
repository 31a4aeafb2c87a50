//! Command line arguments and agent tunables

use anyhow::{bail, Context, Result};
use captain_lib::proto::NodeRole;
use captain_lib::{AdmissionPolicy, Coordinates, LocationHint};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Fleet-owned server
    Server,
    /// Volunteered machine
    Volunteer,
}

impl From<Role> for NodeRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Server => NodeRole::LocalServer,
            Role::Volunteer => NodeRole::Volunteer,
        }
    }
}

/// Captain node agent
#[derive(Debug, Clone, Parser)]
#[command(name = "captain", version, about)]
pub struct Args {
    /// Spinner endpoint, e.g. http://spinner.example.net:50051
    #[arg(long, env = "CAPTAIN_SPINNER", value_parser = parse_spinner_url)]
    pub spinner: Url,

    #[arg(long, env = "CAPTAIN_ROLE", value_enum)]
    pub role: Role,

    /// Where this node sits relative to the spinner
    #[arg(long, env = "CAPTAIN_LOCATION", default_value = "default")]
    pub location: LocationHint,

    /// Tags advertised with the join request
    #[arg(long = "tag", env = "CAPTAIN_TAGS", value_delimiter = ',', required = true, num_args = 1..)]
    pub tags: Vec<String>,

    /// Address other nodes reach this node at
    #[arg(long, env = "CAPTAIN_LOCAL_ADDRESS")]
    pub local_address: IpAddr,
}

fn parse_spinner_url(value: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(value).map_err(|e| format!("invalid URL {:?}: {}", value, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {:?} (expected http or https)", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("URL {:?} has no host", value));
    }
    Ok(url)
}

/// Agent tunables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// API server port for health, metrics and status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Usage sampling interval in milliseconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Status report interval in seconds
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// How long running tasks may finish once the session drains
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub admission_policy: AdmissionPolicy,

    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,

    #[serde(default)]
    pub latitude: f64,

    #[serde(default)]
    pub longitude: f64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_report_interval() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            sample_interval_ms: default_sample_interval(),
            report_interval_secs: default_report_interval(),
            drain_timeout_secs: default_drain_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            admission_policy: AdmissionPolicy::default(),
            max_concurrent_tasks: None,
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

impl AgentConfig {
    /// Load from the optional `CAPTAIN_CONFIG` file, then `CAPTAIN_*` variables
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CAPTAIN_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("CAPTAIN").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            bail!("sample_interval_ms must be greater than zero");
        }
        if self.report_interval_secs == 0 {
            bail!("report_interval_secs must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_tasks == Some(0) {
            bail!("max_concurrent_tasks must be at least 1 when set");
        }
        if !self.coordinates().is_valid() {
            bail!(
                "latitude/longitude out of range: {}, {}",
                self.latitude,
                self.longitude
            );
        }
        Ok(())
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
