//! Node selection.
//!
//! Selection is a pure function of a registry snapshot and a request: nodes
//! that cannot serve the model or are unreachable are dropped, and the rest
//! are ranked best-first by
//!
//! 1. status (healthy, then degraded, then never-checked),
//! 2. declared priority, in the configured [`PriorityOrder`],
//! 3. last measured latency, ascending, with unmeasured nodes last,
//! 4. node id, lexicographically.
//!
//! The last key makes the ordering total, so equal inputs always produce the
//! same ranking.
use crate::node::{Node, NodeStatus};
use crate::request::GenerationRequest;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// Which end of the priority scale wins a tie-break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityOrder {
    /// Priority 1 is preferred over priority 2.
    #[default]
    LowerFirst,
    /// Priority 2 is preferred over priority 1.
    HigherFirst,
}

impl PriorityOrder {
    fn compare(self, a: i32, b: i32) -> Ordering {
        match self {
            PriorityOrder::LowerFirst => a.cmp(&b),
            PriorityOrder::HigherFirst => b.cmp(&a),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Selector {
    priority_order: PriorityOrder,
}

impl Selector {
    pub fn new(priority_order: PriorityOrder) -> Self {
        Self { priority_order }
    }

    /// Ranked candidates for `request`, best first. Empty when nothing qualifies.
    pub fn select(&self, nodes: &[Node], request: &GenerationRequest) -> Vec<Node> {
        let mut candidates: Vec<Node> = nodes
            .iter()
            .filter(|node| node.supports(&request.model))
            .filter(|node| node.status() != NodeStatus::Unreachable)
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            status_rank(a.status())
                .cmp(&status_rank(b.status()))
                .then_with(|| self.priority_order.compare(a.spec.priority, b.spec.priority))
                .then_with(|| compare_latency(a.health.latency, b.health.latency))
                .then_with(|| a.id().cmp(b.id()))
        });
        candidates
    }
}

fn status_rank(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Healthy => 0,
        NodeStatus::Degraded => 1,
        NodeStatus::Unknown => 2,
        NodeStatus::Unreachable => 3,
    }
}

fn compare_latency(a: Option<Duration>, b: Option<Duration>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
