//! Health probing.
//!
//! The prober hits each node's liveness endpoint with its own timeout and
//! classifies the outcome. Failed probes are results, not errors: a node
//! that times out or refuses the connection is simply `unreachable`. Only a
//! node definition that cannot be turned into a request is reported back
//! as a configuration error.
use crate::client::{ClientError, NodeClient};
use crate::errors::RouterError;
use crate::node::{Node, NodeStatus};
use crate::registry::NodeRegistry;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Deadline for a single liveness request.
    pub timeout: Duration,
    /// Successful probes slower than this mark the node degraded.
    pub degraded_latency: Duration,
    /// Maximum probes in flight during `probe_all`.
    pub concurrency: usize,
    /// Gap between background probe rounds.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            degraded_latency: Duration::from_millis(1000),
            concurrency: 8,
            interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthResult {
    pub status: NodeStatus,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Option<Duration>,
}

fn serialize_millis<S: serde::Serializer>(
    latency: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match latency {
        Some(latency) => serializer.serialize_some(&(latency.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone)]
pub struct HealthProber {
    registry: NodeRegistry,
    client: Arc<dyn NodeClient>,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(registry: NodeRegistry, client: Arc<dyn NodeClient>, config: ProbeConfig) -> Self {
        Self {
            registry,
            client,
            config,
        }
    }

    /// Probes one node. Does not touch the registry.
    pub async fn probe(&self, node: &Node) -> Result<HealthResult, RouterError> {
        let started = Instant::now();
        let outcome = timeout(self.config.timeout, self.client.check_liveness(node)).await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(Ok(())) if latency > self.config.degraded_latency => HealthResult {
                status: NodeStatus::Degraded,
                latency: Some(latency),
            },
            Ok(Ok(())) => HealthResult {
                status: NodeStatus::Healthy,
                latency: Some(latency),
            },
            Ok(Err(ClientError::InvalidAddress(msg))) => {
                return Err(RouterError::Configuration(format!(
                    "node {} cannot be probed: {}",
                    node.id(),
                    msg
                )));
            }
            Ok(Err(e)) => {
                debug!(node = %node.id(), "Probe failed: {}", e);
                HealthResult {
                    status: NodeStatus::Unreachable,
                    latency: None,
                }
            }
            Err(_) => {
                debug!(node = %node.id(), timeout = ?self.config.timeout, "Probe timed out");
                HealthResult {
                    status: NodeStatus::Unreachable,
                    latency: None,
                }
            }
        };
        Ok(result)
    }

    /// Probes `nodes` concurrently and writes each result back to the
    /// registry as soon as its probe completes. All results are committed
    /// even when one node turns out to be misconfigured; the first such
    /// error is returned afterwards. Nodes missing from the registry are
    /// probed and reported but not written back.
    pub async fn probe_all(
        &self,
        nodes: &[Node],
    ) -> Result<HashMap<String, HealthResult>, RouterError> {
        let outcomes: Vec<(String, Result<HealthResult, RouterError>)> =
            futures_util::stream::iter(nodes.to_vec())
                .map(|node| {
                    let prober = self.clone();
                    async move {
                        let outcome = prober.probe(&node).await;
                        if let Ok(result) = &outcome {
                            prober.commit(node.id(), result);
                        }
                        (node.id().to_string(), outcome)
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut results = HashMap::with_capacity(outcomes.len());
        let mut first_error = None;
        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    results.insert(node_id, result);
                }
                Err(e) => {
                    error!(node = %node_id, "{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    fn commit(&self, node_id: &str, result: &HealthResult) {
        if let Err(e) = self
            .registry
            .update_health(node_id, result.status, result.latency)
        {
            warn!(node = %node_id, "Probe result not recorded: {}", e);
        }
    }

    /// Probes every registered node once.
    pub async fn probe_registry(&self) -> Result<HashMap<String, HealthResult>, RouterError> {
        let nodes = self.registry.list_nodes();
        self.probe_all(&nodes).await
    }

    /// Runs probe rounds on a fixed interval until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.config.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Health prober started: interval={}s, timeout={}ms",
                self.config.interval.as_secs(),
                self.config.timeout.as_millis()
            );

            loop {
                timer.tick().await;
                match self.probe_registry().await {
                    Ok(results) => debug!("Probed {} nodes", results.len()),
                    Err(e) => error!("Health probe round failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Capabilities, NodeSpec};
    use crate::test_utils::{Liveness, ScriptedNodeClient};

    fn registry_with(ids: &[&str]) -> NodeRegistry {
        let registry = NodeRegistry::new();
        for id in ids {
            registry
                .register(
                    NodeSpec::builder()
                        .id(*id)
                        .address(format!("http://{id}.lan:11434").parse().unwrap())
                        .capabilities(Capabilities::for_models(["llama3"]))
                        .build(),
                )
                .unwrap();
        }
        registry
    }

    fn prober(registry: &NodeRegistry, client: &ScriptedNodeClient) -> HealthProber {
        HealthProber::new(
            registry.clone(),
            Arc::new(client.clone()),
            ProbeConfig {
                timeout: Duration::from_millis(500),
                degraded_latency: Duration::from_millis(200),
                concurrency: 4,
                interval: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_classifies_latency() {
        let registry = registry_with(&["fast", "slow"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("fast", Liveness::Up(Duration::from_millis(20)));
        client.set_liveness("slow", Liveness::Up(Duration::from_millis(300)));
        let prober = prober(&registry, &client);

        let fast = prober.probe(&registry.get("fast").unwrap()).await.unwrap();
        assert_eq!(fast.status, NodeStatus::Healthy);
        assert!(fast.latency.is_some());

        let slow = prober.probe(&registry.get("slow").unwrap()).await.unwrap();
        assert_eq!(slow.status, NodeStatus::Degraded);
        assert!(slow.latency.unwrap() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_and_timeout_are_unreachable() {
        let registry = registry_with(&["down", "hung"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("down", Liveness::Down);
        client.set_liveness("hung", Liveness::Up(Duration::from_secs(60)));
        let prober = prober(&registry, &client);

        for id in ["down", "hung"] {
            let result = prober.probe(&registry.get(id).unwrap()).await.unwrap();
            assert_eq!(result.status, NodeStatus::Unreachable);
            assert_eq!(result.latency, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_all_writes_back_results() {
        let registry = registry_with(&["a", "b", "c"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(10)));
        client.set_liveness("b", Liveness::Down);
        client.set_liveness("c", Liveness::Up(Duration::from_millis(250)));
        let prober = prober(&registry, &client);

        let results = prober.probe_registry().await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(registry.get("a").unwrap().status(), NodeStatus::Healthy);
        assert_eq!(registry.get("b").unwrap().status(), NodeStatus::Unreachable);
        assert_eq!(registry.get("c").unwrap().status(), NodeStatus::Degraded);
        assert!(registry.get("a").unwrap().health.last_checked.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_node_does_not_block_batch() {
        let registry = registry_with(&["a", "b", "hung"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(10)));
        client.set_liveness("b", Liveness::Up(Duration::from_millis(10)));
        client.set_liveness("hung", Liveness::Up(Duration::from_secs(3600)));
        let prober = prober(&registry, &client);

        let started = Instant::now();
        let results = prober.probe_registry().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(results["hung"].status, NodeStatus::Unreachable);
        assert_eq!(results["a"].status, NodeStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_recovers_unreachable_node() {
        let registry = registry_with(&["a"]);
        registry.record_failure("a", 1).unwrap();
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(5)));

        prober(&registry, &client).probe_registry().await.unwrap();
        let node = registry.get("a").unwrap();
        assert_eq!(node.status(), NodeStatus::Healthy);
        assert_eq!(node.health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_node_does_not_block_commits() {
        let registry = registry_with(&["a"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(5)));
        client.set_liveness("stray", Liveness::Up(Duration::from_millis(5)));
        let stray = Node::new(
            NodeSpec::builder()
                .id("stray")
                .address("http://stray.lan:11434".parse().unwrap())
                .capabilities(Capabilities::for_models(["llama3"]))
                .build(),
        );

        let results = prober(&registry, &client)
            .probe_all(&[stray, registry.get("a").unwrap()])
            .await
            .unwrap();

        assert_eq!(results["stray"].status, NodeStatus::Healthy);
        assert_eq!(registry.get("a").unwrap().status(), NodeStatus::Healthy);
        assert!(registry.get("stray").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_misconfigured_node_is_configuration_error() {
        let registry = registry_with(&["a", "broken"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(5)));
        client.set_liveness("broken", Liveness::Misconfigured);

        let err = prober(&registry, &client).probe_registry().await.unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
        // The healthy node's result is still committed.
        assert_eq!(registry.get("a").unwrap().status(), NodeStatus::Healthy);
        assert_eq!(registry.get("broken").unwrap().status(), NodeStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_probes_periodically() {
        let registry = registry_with(&["a"]);
        let client = ScriptedNodeClient::new();
        client.set_liveness("a", Liveness::Up(Duration::from_millis(5)));

        let handle = prober(&registry, &client).spawn();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.abort();

        assert!(client.liveness_checks("a") >= 2);
        assert_eq!(registry.get("a").unwrap().status(), NodeStatus::Healthy);
    }
}
