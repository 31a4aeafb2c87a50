//! Image pull progress records
//!
//! The daemon reports a pull as a stream of `{"status": ..., "id": ...}`
//! objects. Each one is converted once into a [`PullProgress`] at the
//! runtime boundary.

use bollard::models::CreateImageInfo;

/// Tag the daemon reports as an "id" while resolving a reference; not a layer
const TAG_PSEUDO_LAYER: &str = "latest";

/// Statuses that identify a layer now present in the local cache
const CACHED_LAYER_STATUSES: &[&str] = &["Already exists", "Pulling fs layer"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
}

impl From<CreateImageInfo> for PullProgress {
    fn from(info: CreateImageInfo) -> Self {
        Self {
            id: info.id,
            status: info.status,
        }
    }
}

impl PullProgress {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            status: Some(status.into()),
        }
    }

    /// The layer id this record announces as cached, if any
    pub fn cached_layer(&self) -> Option<&str> {
        let id = self.id.as_deref()?;
        let status = self.status.as_deref()?;
        if id.is_empty() || id == TAG_PSEUDO_LAYER {
            return None;
        }
        CACHED_LAYER_STATUSES.contains(&status).then_some(id)
    }
}
