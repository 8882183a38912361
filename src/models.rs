//! JSON bodies for the HTTP surface.
use crate::errors::{AttemptFailure, RouterError};
use crate::node::{Endpoints, GpuInfo, Node, NodeStatus};
use crate::probe::HealthResult;
use crate::request::GenerationRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, UNIX_EPOCH};

/// Body of `POST /v1/generate`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateBody {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    /// Total budget across failover attempts, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

impl From<GenerateBody> for GenerationRequest {
    fn from(body: GenerateBody) -> Self {
        GenerationRequest {
            model: body.model,
            prompt: body.prompt,
            stream: body.stream,
            deadline: body.deadline_ms.map(Duration::from_millis),
            options: body.options,
        }
    }
}

/// Reply to a non-streamed `POST /v1/generate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateReply {
    pub content: String,
    pub node_used: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub attempted_nodes: Vec<AttemptFailure>,
}

impl From<&RouterError> for ErrorBody {
    fn from(error: &RouterError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            attempted_nodes: error.failures().to_vec(),
        }
    }
}

/// A node as reported by `GET /v1/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    pub id: String,
    pub address: String,
    pub priority: i32,
    pub models: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
    pub endpoints: Endpoints,
    pub status: NodeStatus,
    pub latency_ms: Option<u64>,
    /// Seconds since the Unix epoch.
    pub last_checked: Option<u64>,
    pub consecutive_failures: u32,
}

impl From<&Node> for NodeView {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id().to_string(),
            address: node.spec.address.to_string(),
            priority: node.spec.priority,
            models: node.spec.capabilities.models.clone(),
            gpu: node.spec.capabilities.gpu.clone(),
            endpoints: node.spec.endpoints.clone(),
            status: node.status(),
            latency_ms: node.health.latency.map(|l| l.as_millis() as u64),
            last_checked: node
                .health
                .last_checked
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            consecutive_failures: node.health.consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeView>,
}

impl ListNodesResponse {
    pub fn from_nodes(nodes: &[Node]) -> Self {
        Self {
            nodes: nodes.iter().map(NodeView::from).collect(),
        }
    }
}

/// Reply to `POST /v1/nodes/probe`.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub results: BTreeMap<String, HealthResult>,
}
