//! Switchyard - a request router for a fleet of self-hosted inference nodes
//!
//! The library keeps a registry of nodes, probes their health in the
//! background, ranks the nodes able to serve each request and dispatches
//! with failover. The HTTP surface in [`build_router`] is a thin layer over
//! [`dispatch::Dispatcher`] and [`probe::HealthProber`].

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod client;
pub mod dispatch;
pub mod errors;
pub mod framing;
pub mod handlers;
pub mod models;
pub mod node;
pub mod nodes_file;
pub mod probe;
pub mod registry;
pub mod request;
pub mod selector;
pub mod stats;

use dispatch::Dispatcher;
use probe::HealthProber;

/// Shared state for the HTTP handlers
#[derive(Clone, Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub prober: HealthProber,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, prober: HealthProber) -> Self {
        Self { dispatcher, prober }
    }
}

/// Build the main router
/// This creates routes for:
/// - `/v1/generate` - Routes a generation request to the best available node
/// - `/v1/nodes` - Lists registered nodes with their live health
/// - `/v1/nodes/probe` - Probes every node now
/// - `/v1/stats` - Routing counters
/// - `/health` - Liveness of the router itself
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/generate", post(handlers::generate))
        .route("/v1/nodes", get(handlers::list_nodes))
        .route("/v1/nodes/probe", post(handlers::probe_nodes))
        .route("/v1/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` names every exported metric, e.g. `switchyard_http_requests_total`.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::dispatch::DispatchConfig;
    use crate::node::{Capabilities, NodeSpec};
    use crate::probe::ProbeConfig;
    use crate::registry::NodeRegistry;
    use crate::selector::Selector;
    use crate::stats::Stats;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use test_utils::{Behavior, Liveness, ScriptedNodeClient};

    fn spec(id: &str, priority: i32, models: &[&str]) -> NodeSpec {
        NodeSpec::builder()
            .id(id)
            .address(format!("http://{id}.lan:11434").parse().unwrap())
            .priority(priority)
            .capabilities(Capabilities::for_models(models.iter().copied()))
            .build()
    }

    fn server(registry: &NodeRegistry, client: &ScriptedNodeClient) -> TestServer {
        let client: Arc<dyn crate::client::NodeClient> = Arc::new(client.clone());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Selector::default(),
            client.clone(),
            Stats::new(),
            DispatchConfig::default(),
        );
        let prober = HealthProber::new(registry.clone(), client, ProbeConfig::default());
        TestServer::new(build_router(AppState::new(dispatcher, prober))).unwrap()
    }

    fn fleet() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.register(spec("tower", 1, &["llama3", "mistral"])).unwrap();
        registry.register(spec("laptop", 2, &["llama3"])).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_generate_returns_content_and_node_used() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_behavior("tower", Behavior::Reply("Rayleigh scattering".into()));
        let server = server(&registry, &client);

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "Why is the sky blue?"}))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header(handlers::NODE_USED_HEADER), "tower");
        let body: Value = response.json();
        assert_eq!(body["content"], "Rayleigh scattering");
        assert_eq!(body["node_used"], "tower");
        assert!(body["latency_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_non_ascii_node_id_is_echoed_in_header() {
        let registry = NodeRegistry::new();
        registry
            .register(
                NodeSpec::builder()
                    .id("büro-gpu")
                    .address("http://10.0.0.7:11434".parse().unwrap())
                    .capabilities(Capabilities::for_models(["llama3"]))
                    .build(),
            )
            .unwrap();
        let client = ScriptedNodeClient::new();
        client.set_behavior("büro-gpu", Behavior::Reply("hi".into()));

        let response = server(&registry, &client)
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "hi"}))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        let header = response.header(handlers::NODE_USED_HEADER);
        assert_eq!(header.as_bytes(), "büro-gpu".as_bytes());
        let body: Value = response.json();
        assert_eq!(body["node_used"], "büro-gpu");
    }

    #[tokio::test]
    async fn test_generate_fails_over_and_stats_reflect_it() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_behavior("tower", Behavior::Fail(ClientError::Status(500)));
        client.set_behavior("laptop", Behavior::Reply("hello".into()));
        let server = server(&registry, &client);

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "hi"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["node_used"], "laptop");

        let stats: Value = server.get("/v1/stats").await.json();
        assert_eq!(stats["totals"]["requests"], 2);
        assert_eq!(stats["totals"]["failures"], 1);
        assert_eq!(stats["per_node"]["tower"]["failures"], 1);
    }

    #[tokio::test]
    async fn test_unknown_model_is_service_unavailable() {
        let registry = fleet();
        let server = server(&registry, &ScriptedNodeClient::new());

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "gemma", "prompt": "hi"}))
            .await;

        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["kind"], "all_nodes_exhausted");
        assert_eq!(body["attempted_nodes"], json!([]));
    }

    #[tokio::test]
    async fn test_all_nodes_failing_is_bad_gateway_with_attempts() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_behavior("tower", Behavior::Fail(ClientError::Status(500)));
        client.set_behavior("laptop", Behavior::Fail(ClientError::Connection("refused".into())));
        let server = server(&registry, &client);

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "hi"}))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
        let body: Value = response.json();
        let attempted = body["attempted_nodes"].as_array().unwrap();
        assert_eq!(attempted.len(), 2);
        assert_eq!(attempted[0]["node"], "tower");
        assert_eq!(attempted[0]["kind"], "bad_status");
        assert_eq!(attempted[1]["kind"], "connection");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let server = server(&fleet(), &ScriptedNodeClient::new());

        let response = server.post("/v1/generate").text("not json").await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["kind"], "invalid_request");

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "", "prompt": "hi"}))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_streamed_generation_is_ndjson() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_behavior(
            "tower",
            Behavior::Stream(vec![
                Ok("{\"response\":\"Once\"}\n".into()),
                Ok("{\"response\":\" upon\",\"done\":true}\n".into()),
            ]),
        );
        let server = server(&registry, &client);

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "story", "stream": true}))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("content-type"), "application/x-ndjson");
        assert_eq!(response.header(handlers::NODE_USED_HEADER), "tower");
        let lines: Vec<Value> = response
            .text()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["done"], true);
    }

    #[tokio::test]
    async fn test_interrupted_stream_ends_with_error_line() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_behavior(
            "tower",
            Behavior::Stream(vec![
                Ok("{\"response\":\"Once\"}\n".into()),
                Err(ClientError::Connection("reset by peer".into())),
            ]),
        );
        let server = server(&registry, &client);

        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "llama3", "prompt": "story", "stream": true}))
            .await;

        let text = response.text();
        let last: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last["error"]["kind"], "stream_interrupted");
        assert_eq!(client.generate_calls(), vec!["tower"]);
    }

    #[tokio::test]
    async fn test_probe_endpoint_updates_node_listing() {
        let registry = fleet();
        let client = ScriptedNodeClient::new();
        client.set_liveness("tower", Liveness::Up(Duration::from_millis(1)));
        client.set_liveness("laptop", Liveness::Down);
        let server = server(&registry, &client);

        let nodes: Value = server.get("/v1/nodes").await.json();
        assert_eq!(nodes["nodes"][0]["id"], "laptop");
        assert_eq!(nodes["nodes"][0]["status"], "unknown");

        let report = server.post("/v1/nodes/probe").await;
        assert_eq!(report.status_code(), StatusCode::OK);
        let report: Value = report.json();
        assert_eq!(report["results"]["tower"]["status"], "healthy");
        assert_eq!(report["results"]["laptop"]["status"], "unreachable");
        assert!(report["results"]["laptop"]["latency_ms"].is_null());

        let nodes: Value = server.get("/v1/nodes").await.json();
        assert_eq!(nodes["nodes"][0]["status"], "unreachable");
        assert_eq!(nodes["nodes"][1]["status"], "healthy");
        assert!(nodes["nodes"][1]["last_checked"].is_u64());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = server(&fleet(), &ScriptedNodeClient::new());
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["nodes"], 2);
    }
}
