//! Node location used to tag the join request

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where the operator says this node sits relative to the spinner
///
/// Advisory only: it is logged on attach and never changes the
/// coordinates a [`Geolocator`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationHint {
    Close,
    Far,
    #[default]
    Default,
}

impl FromStr for LocationHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "close" => Ok(LocationHint::Close),
            "far" => Ok(LocationHint::Far),
            "default" => Ok(LocationHint::Default),
            other => Err(format!(
                "unknown location {:?} (expected close, far or default)",
                other
            )),
        }
    }
}

impl fmt::Display for LocationHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocationHint::Close => "close",
            LocationHint::Far => "far",
            LocationHint::Default => "default",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[async_trait]
pub trait Geolocator: Send + Sync {
    /// Coordinates for the node reachable at `address`
    async fn locate(&self, address: &str) -> Coordinates;
}

/// Returns the configured coordinates for every lookup
#[derive(Debug, Clone, Default)]
pub struct StaticGeolocator {
    coordinates: Coordinates,
}

impl StaticGeolocator {
    pub fn new(coordinates: Coordinates) -> Self {
        Self { coordinates }
    }
}

#[async_trait]
impl Geolocator for StaticGeolocator {
    async fn locate(&self, _address: &str) -> Coordinates {
        self.coordinates
    }
}
