//! Request dispatch with failover.
//!
//! `generate` ranks the candidates for a request, then tries them best-first
//! until one succeeds, the candidates run out, or the request deadline
//! passes. Every attempt is counted in [`Stats`] and feeds the attempted
//! node's circuit breaker in the [`NodeRegistry`].
//!
//! Streamed replies are committed to a node once its first chunk arrives.
//! A failure before that point fails over like any other attempt; a failure
//! after it is surfaced to the caller as [`RouterError::StreamInterrupted`],
//! since partial output cannot be replayed against another node.
use crate::client::{ChunkStream, ClientError, NodeClient, NodeReply};
use crate::errors::{AttemptFailure, ExhaustionReason, FailureKind, RouterError};
use crate::node::Node;
use crate::registry::NodeRegistry;
use crate::request::{GenerationRequest, GenerationResponse, ResponseBody, ResponseStream};
use crate::selector::Selector;
use crate::stats::Stats;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upper bound for one attempt; shortened to whatever remains of the deadline.
    pub attempt_timeout: Duration,
    /// Deadline for requests that do not carry their own.
    pub default_deadline: Duration,
    /// Consecutive failures after which a node is marked unreachable.
    pub failure_threshold: u32,
    /// Cap on candidates tried per request. `None` tries every candidate.
    pub max_attempts: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            default_deadline: Duration::from_secs(120),
            failure_threshold: 3,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: NodeRegistry,
    selector: Selector,
    client: Arc<dyn NodeClient>,
    stats: Stats,
    config: DispatchConfig,
}

/// A successful attempt before its reply is handed to the caller.
enum Accepted {
    Complete(String),
    Stream { first: Bytes, rest: ChunkStream },
}

impl Dispatcher {
    pub fn new(
        registry: NodeRegistry,
        selector: Selector,
        client: Arc<dyn NodeClient>,
        stats: Stats,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            selector,
            client,
            stats,
            config,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    #[instrument(skip(self, request), fields(model = %request.model, stream = request.stream))]
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, RouterError> {
        request.validate()?;
        let deadline =
            Instant::now() + request.deadline.unwrap_or(self.config.default_deadline);

        let nodes = self.registry.list_nodes();
        let mut candidates = self.selector.select(&nodes, &request);
        if let Some(max_attempts) = self.config.max_attempts {
            candidates.truncate(max_attempts);
        }
        if candidates.is_empty() {
            warn!("No eligible node for model");
            return Err(self.exhausted(&request, ExhaustionReason::NoEligibleNodes, Vec::new()));
        }
        debug!(
            candidates = ?candidates.iter().map(Node::id).collect::<Vec<_>>(),
            "Selected candidates"
        );

        let mut failures = Vec::with_capacity(candidates.len());
        for node in &candidates {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.exhausted(&request, ExhaustionReason::DeadlineExceeded, failures));
            }
            let budget = (deadline - now).min(self.config.attempt_timeout);
            let attempt_started = Instant::now();

            match timeout(budget, self.attempt(node, &request)).await {
                Ok(Ok(accepted)) => {
                    let latency = attempt_started.elapsed();
                    return Ok(self.accept(node, latency, accepted));
                }
                Ok(Err(e)) => {
                    failures.push(self.reject(node, failure_kind(&e), e.to_string()));
                }
                Err(_) => {
                    let message = format!("no reply within {}ms", budget.as_millis());
                    failures.push(self.reject(node, FailureKind::Timeout, message));
                    if Instant::now() >= deadline {
                        return Err(self.exhausted(
                            &request,
                            ExhaustionReason::DeadlineExceeded,
                            failures,
                        ));
                    }
                }
            }
        }

        Err(self.exhausted(&request, ExhaustionReason::AllFailed, failures))
    }

    /// Sends the request and, for streams, waits for the first chunk.
    async fn attempt(
        &self,
        node: &Node,
        request: &GenerationRequest,
    ) -> Result<Accepted, ClientError> {
        match self.client.generate(node, request).await? {
            NodeReply::Complete(content) => Ok(Accepted::Complete(content)),
            NodeReply::Stream(mut rest) => match rest.next().await {
                Some(Ok(first)) => Ok(Accepted::Stream { first, rest }),
                Some(Err(e)) => Err(e),
                None => Err(ClientError::InvalidResponse(
                    "stream ended before the first chunk".to_string(),
                )),
            },
        }
    }

    fn accept(&self, node: &Node, latency: Duration, accepted: Accepted) -> GenerationResponse {
        if let Err(e) = self.registry.record_success(node.id()) {
            warn!(node = %node.id(), "Could not record success: {}", e);
        }
        self.stats.record_success(node.id(), latency);
        info!(
            node = %node.id(),
            latency_ms = latency.as_millis() as u64,
            "Request routed"
        );

        let body = match accepted {
            Accepted::Complete(content) => ResponseBody::Complete(content),
            Accepted::Stream { first, rest } => ResponseBody::Stream(self.forward_stream(node, first, rest)),
        };
        GenerationResponse {
            node_used: node.id().to_string(),
            latency,
            body,
        }
    }

    fn reject(&self, node: &Node, kind: FailureKind, message: String) -> AttemptFailure {
        warn!(node = %node.id(), ?kind, "Attempt failed: {}", message);
        self.stats.record_failure(node.id());
        if let Err(e) = self
            .registry
            .record_failure(node.id(), self.config.failure_threshold)
        {
            warn!(node = %node.id(), "Could not record failure: {}", e);
        }
        AttemptFailure {
            node: node.id().to_string(),
            kind,
            message,
        }
    }

    fn exhausted(
        &self,
        request: &GenerationRequest,
        reason: ExhaustionReason,
        failures: Vec<AttemptFailure>,
    ) -> RouterError {
        self.stats.record_exhausted();
        warn!(%reason, attempts = failures.len(), "Request exhausted all candidates");
        RouterError::AllNodesExhausted {
            model: request.model.clone(),
            reason,
            failures,
        }
    }

    /// Yields `first`, then the rest of the node's stream. The first error
    /// after `first` ends the stream with `StreamInterrupted`.
    fn forward_stream(&self, node: &Node, first: Bytes, rest: ChunkStream) -> ResponseStream {
        let interruption = Interruption {
            node_id: node.id().to_string(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            failure_threshold: self.config.failure_threshold,
        };

        let tail = stream::unfold(Some(rest), move |state| {
            let interruption = interruption.clone();
            async move {
                let mut rest = state?;
                match rest.next().await {
                    Some(Ok(chunk)) => Some((Ok(chunk), Some(rest))),
                    Some(Err(e)) => Some((Err(interruption.record(e)), None)),
                    None => None,
                }
            }
        });

        stream::once(async move { Ok(first) }).chain(tail).boxed()
    }
}

#[derive(Debug, Clone)]
struct Interruption {
    node_id: String,
    registry: NodeRegistry,
    stats: Stats,
    failure_threshold: u32,
}

impl Interruption {
    fn record(&self, error: ClientError) -> RouterError {
        warn!(node = %self.node_id, "Stream interrupted: {}", error);
        self.stats.record_interrupted(&self.node_id);
        if let Err(e) = self
            .registry
            .record_failure(&self.node_id, self.failure_threshold)
        {
            warn!(node = %self.node_id, "Could not record failure: {}", e);
        }
        RouterError::StreamInterrupted {
            node: self.node_id.clone(),
            message: error.to_string(),
        }
    }
}

fn failure_kind(error: &ClientError) -> FailureKind {
    match error {
        ClientError::InvalidAddress(_) => FailureKind::Misconfigured,
        ClientError::Connection(_) => FailureKind::Connection,
        ClientError::Status(_) => FailureKind::BadStatus,
        ClientError::InvalidResponse(_) => FailureKind::InvalidResponse,
    }
}
