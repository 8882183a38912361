//! Nodes are the inference backends requests are routed to.
//!
//! A node has two halves: a declared [`NodeSpec`] that is fixed at
//! registration, and live [`NodeHealth`] that the prober and dispatcher
//! keep refreshing.
use crate::errors::RouterError;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};
use url::Url;

/// Declared attributes of a node, as read from the node file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct NodeSpec {
    #[builder(into)]
    pub id: String,
    pub address: Url,
    /// Tie-break rank. Whether lower or higher wins is decided by the
    /// selector's [`PriorityOrder`](crate::selector::PriorityOrder).
    #[serde(default)]
    #[builder(default)]
    pub priority: i32,
    #[serde(default)]
    #[builder(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    #[builder(default)]
    pub endpoints: Endpoints,
}

impl NodeSpec {
    /// Rejects node definitions that can never be routed to.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.id.trim().is_empty() {
            return Err(RouterError::Configuration(
                "node id must not be empty".to_string(),
            ));
        }
        // Ids are echoed back in the x-node-used response header.
        if self.id.chars().any(char::is_control) {
            return Err(RouterError::Configuration(format!(
                "node id {:?} contains control characters",
                self.id
            )));
        }
        if !matches!(self.address.scheme(), "http" | "https") {
            return Err(RouterError::Configuration(format!(
                "node {} has unsupported address scheme '{}'",
                self.id,
                self.address.scheme()
            )));
        }
        if self.capabilities.models.is_empty() {
            return Err(RouterError::Configuration(format!(
                "node {} declares no models",
                self.id
            )));
        }
        if self.capabilities.models.iter().any(|m| m.trim().is_empty()) {
            return Err(RouterError::Configuration(format!(
                "node {} declares an empty model name",
                self.id
            )));
        }
        for path in [&self.endpoints.health, &self.endpoints.generate] {
            if !path.starts_with('/') {
                return Err(RouterError::Configuration(format!(
                    "node {} endpoint '{}' must start with '/'",
                    self.id, path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub models: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
}

impl Capabilities {
    pub fn for_models<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            gpu: None,
        }
    }

    pub fn with_gpu(mut self, gpu: GpuInfo) -> Self {
        self.gpu = Some(gpu);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// Paths on the node for the liveness probe and for generation.
/// Defaults follow the Ollama API. Paths are resolved relative to the
/// node address, so an address with a path prefix keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default = "default_health_path")]
    pub health: String,
    #[serde(default = "default_generate_path")]
    pub generate: String,
}

fn default_health_path() -> String {
    "/api/tags".to_string()
}

fn default_generate_path() -> String {
    "/api/generate".to_string()
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            health: default_health_path(),
            generate: default_generate_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not probed or dispatched to yet.
    #[default]
    Unknown,
    Healthy,
    /// Alive but slow, or recently failing below the circuit-breaker threshold.
    Degraded,
    /// Excluded from selection until a probe succeeds.
    Unreachable,
}

/// Live attributes of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeHealth {
    pub status: NodeStatus,
    pub latency: Option<Duration>,
    pub last_checked: Option<SystemTime>,
    pub consecutive_failures: u32,
}

/// Point-in-time view of a registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub spec: NodeSpec,
    pub health: NodeHealth,
}

impl Node {
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            health: NodeHealth::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn status(&self) -> NodeStatus {
        self.health.status
    }

    pub fn supports(&self, model: &str) -> bool {
        self.spec.capabilities.models.contains(model)
    }
}
