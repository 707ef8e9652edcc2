use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{MontageError, Result};
use crate::types::NodeId;

/// Node id the coordinator answers to unless configured otherwise.
pub const DEFAULT_COORDINATOR_ID: &str = "coordinator";

/// Vote deadline and decision re-broadcast interval.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_millis(6000);

/// Coordinator protocol settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name under which participants address the coordinator.
    pub node_id: NodeId,
    /// Time allowed, from the first vote request, for every vote to arrive.
    #[serde(with = "duration_ms", rename = "vote_timeout_ms")]
    pub vote_timeout: Duration,
    /// Wait between re-broadcasts of a decision that is not yet fully acknowledged.
    #[serde(with = "duration_ms", rename = "ack_retry_interval_ms")]
    pub ack_retry_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from(DEFAULT_COORDINATOR_ID),
            vote_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            ack_retry_interval: DEFAULT_PROTOCOL_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_timeouts(mut self, vote_timeout: Duration, ack_retry_interval: Duration) -> Self {
        self.vote_timeout = vote_timeout;
        self.ack_retry_interval = ack_retry_interval;
        self
    }
}

/// Participant protocol settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParticipantConfig {
    pub node_id: NodeId,
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: NodeId,
}

impl ParticipantConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            coordinator_id: default_coordinator_id(),
        }
    }
}

fn default_coordinator_id() -> NodeId {
    NodeId::from(DEFAULT_COORDINATOR_ID)
}

/// Launcher-level settings, loadable from a TOML file.
///
/// Every field can also be supplied on the command line; values given there
/// take precedence over the file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Address this node accepts protocol messages on.
    pub listen: Option<String>,
    /// Transport address of every other node this node talks to.
    pub peers: BTreeMap<NodeId, String>,
    /// Directory holding the recovery log.
    pub state_dir: Option<PathBuf>,
    /// Output directory (coordinator) or source directory (participant).
    pub data_dir: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| MontageError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MontageError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
