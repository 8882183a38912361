//! Error taxonomy for the router core.
//!
//! Registry misuse and configuration problems surface directly. Per-node
//! dispatch failures are collected as [`AttemptFailure`]s and only surface
//! once every candidate is exhausted.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already registered: {0}")]
    DuplicateNode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no node could serve model {model}: {reason} ({} attempts)", .failures.len())]
    AllNodesExhausted {
        model: String,
        reason: ExhaustionReason,
        failures: Vec<AttemptFailure>,
    },

    #[error("stream from node {node} interrupted: {message}")]
    StreamInterrupted { node: String, message: String },
}

impl RouterError {
    /// Stable identifier for the error kind, used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Configuration(_) => "configuration_error",
            RouterError::NodeNotFound(_) => "node_not_found",
            RouterError::DuplicateNode(_) => "duplicate_node",
            RouterError::InvalidRequest(_) => "invalid_request",
            RouterError::AllNodesExhausted { .. } => "all_nodes_exhausted",
            RouterError::StreamInterrupted { .. } => "stream_interrupted",
        }
    }

    /// Per-node failures collected before the error was raised.
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            RouterError::AllNodesExhausted { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Why a `generate` call ran out of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    /// Selection returned no node for the requested model.
    NoEligibleNodes,
    /// Every candidate was attempted and failed.
    AllFailed,
    /// The request deadline elapsed before any attempt succeeded.
    DeadlineExceeded,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExhaustionReason::NoEligibleNodes => "no eligible nodes",
            ExhaustionReason::AllFailed => "all candidates failed",
            ExhaustionReason::DeadlineExceeded => "deadline exceeded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    BadStatus,
    InvalidResponse,
    Misconfigured,
}

/// One failed attempt against one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub node: String,
    pub kind: FailureKind,
    pub message: String,
}
