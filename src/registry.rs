//! The node registry: the single owner of declared node attributes and
//! their live health.
//!
//! Each node's health fields are updated under that node's map entry lock,
//! so concurrent probes and dispatch outcomes never lose an update. Nodes
//! are never removed once registered.
use crate::errors::RouterError;
use crate::node::{Node, NodeSpec, NodeStatus};
use crate::nodes_file::{NodesFile, NodesStream};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes_file(file: NodesFile) -> Result<Self, RouterError> {
        let registry = Self::new();
        for spec in file.nodes {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub async fn from_config_file(path: &Path) -> Result<Self, RouterError> {
        let file = NodesFile::load(path).await?;
        let registry = Self::from_nodes_file(file)?;
        info!(
            "Loaded {} nodes from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Adds a node with `unknown` health. Fails if the id is taken.
    pub fn register(&self, spec: NodeSpec) -> Result<(), RouterError> {
        spec.validate()?;
        match self.nodes.entry(spec.id.clone()) {
            Entry::Occupied(_) => Err(RouterError::DuplicateNode(spec.id)),
            Entry::Vacant(slot) => {
                debug!(node = %spec.id, address = %spec.address, "Registered node");
                slot.insert(Node::new(spec));
                Ok(())
            }
        }
    }

    /// Swaps the declared attributes of an existing node, resetting its health.
    /// Returns the previous declaration.
    pub fn replace(&self, spec: NodeSpec) -> Result<NodeSpec, RouterError> {
        spec.validate()?;
        let mut node = self
            .nodes
            .get_mut(&spec.id)
            .ok_or_else(|| RouterError::NodeNotFound(spec.id.clone()))?;
        info!(node = %spec.id, "Replacing node declaration");
        let previous = std::mem::replace(&mut *node, Node::new(spec));
        Ok(previous.spec)
    }

    /// Snapshot of every node, ordered by id.
    pub fn list_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn get(&self, node_id: &str) -> Result<Node, RouterError> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouterError::NodeNotFound(node_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records a probe outcome. Last write wins. A non-unreachable status
    /// also closes the node's circuit breaker.
    pub fn update_health(
        &self,
        node_id: &str,
        status: NodeStatus,
        latency: Option<Duration>,
    ) -> Result<(), RouterError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RouterError::NodeNotFound(node_id.to_string()))?;
        let previous = node.health.status;
        node.health.status = status;
        node.health.latency = latency;
        node.health.last_checked = Some(SystemTime::now());
        if status != NodeStatus::Unreachable {
            node.health.consecutive_failures = 0;
        }
        if previous != status {
            log_transition(node_id, previous, status);
        }
        Ok(())
    }

    /// Counts a failed dispatch attempt. The node is degraded on the first
    /// failure and becomes unreachable once `threshold` consecutive failures
    /// have been seen. Returns the resulting status.
    pub fn record_failure(&self, node_id: &str, threshold: u32) -> Result<NodeStatus, RouterError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RouterError::NodeNotFound(node_id.to_string()))?;
        let previous = node.health.status;
        node.health.consecutive_failures = node.health.consecutive_failures.saturating_add(1);
        node.health.last_checked = Some(SystemTime::now());
        if node.health.consecutive_failures >= threshold {
            node.health.status = NodeStatus::Unreachable;
        } else if previous != NodeStatus::Unreachable {
            node.health.status = NodeStatus::Degraded;
        }
        let status = node.health.status;
        if previous != status {
            if status == NodeStatus::Unreachable {
                warn!(
                    node = %node_id,
                    failures = node.health.consecutive_failures,
                    "Circuit opened after consecutive failures"
                );
            } else {
                log_transition(node_id, previous, status);
            }
        }
        Ok(status)
    }

    /// Counts a successful dispatch attempt: resets the failure streak and
    /// promotes a never-checked node to healthy.
    pub fn record_success(&self, node_id: &str) -> Result<NodeStatus, RouterError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RouterError::NodeNotFound(node_id.to_string()))?;
        node.health.consecutive_failures = 0;
        if node.health.status == NodeStatus::Unknown {
            node.health.status = NodeStatus::Healthy;
        }
        Ok(node.health.status)
    }

    /// Registers nodes that appear in a stream of node file updates.
    /// Existing nodes are never removed or redefined by a reload.
    pub async fn receive_updates<W: NodesStream + Send + 'static>(
        &self,
        nodes_stream: W,
    ) -> Result<(), RouterError> {
        let registry = self.clone();
        let mut rx = nodes_stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(file) => registry.merge(file),
                    Err(e) => error!("Failed to reload node file: {}", e),
                }
            }
        });

        Ok(())
    }

    fn merge(&self, file: NodesFile) {
        let listed: Vec<String> = file.nodes.iter().map(|spec| spec.id.clone()).collect();
        for spec in file.nodes {
            let id = spec.id.clone();
            let changed = self
                .nodes
                .get(&id)
                .map(|existing| existing.spec != spec);
            match changed {
                None => match self.register(spec) {
                    Ok(()) => info!(node = %id, "Added node from reloaded file"),
                    Err(e) => error!(node = %id, "Rejected node from reloaded file: {}", e),
                },
                Some(true) => warn!(
                    node = %id,
                    "Declared attributes changed on reload; keeping the registered declaration"
                ),
                Some(false) => {}
            }
        }
        for node in self.list_nodes() {
            if !listed.iter().any(|id| id == node.id()) {
                warn!(node = %node.id(), "Node no longer listed in file; it stays registered");
            }
        }
    }
}

fn log_transition(node_id: &str, from: NodeStatus, to: NodeStatus) {
    match to {
        NodeStatus::Unreachable | NodeStatus::Degraded => {
            warn!(node = %node_id, ?from, ?to, "Node health changed")
        }
        _ => info!(node = %node_id, ?from, ?to, "Node health changed"),
    }
}
