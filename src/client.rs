//! Transport to inference nodes.
//!
//! [`HttpClient`] abstracts the raw HTTP round-trip so tests can swap in a
//! mock. [`NodeClient`] is the node endpoint contract the prober and the
//! dispatcher talk to, and [`HttpNodeClient`] implements it over any
//! [`HttpClient`].
use crate::framing::{LineBufferedStream, LineTooLong};
use crate::node::Node;
use crate::request::GenerationRequest;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Upper bound on a buffered, non-streamed node reply and on one streamed line.
const MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Body,
>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client(pool_idle_timeout: Duration, pool_max_idle_per_host: usize) -> HyperClient {
    let https = hyper_tls::HttpsConnector::new();

    tracing::debug!(
        "HTTP client pool config: idle_timeout={}s, max_idle_per_host={}",
        pool_idle_timeout.as_secs(),
        pool_max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool_idle_timeout)
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The node definition cannot be turned into a request. Not a node fault.
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("node returned status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<LineTooLong> for ClientError {
    fn from(e: LineTooLong) -> Self {
        ClientError::InvalidResponse(e.to_string())
    }
}

pub type ChunkStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// What a node sent back for a generation call.
pub enum NodeReply {
    Complete(String),
    Stream(ChunkStream),
}

impl std::fmt::Debug for NodeReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeReply::Complete(content) => f.debug_tuple("Complete").field(content).finish(),
            NodeReply::Stream(_) => f.write_str("Stream(<chunks>)"),
        }
    }
}

#[async_trait]
pub trait NodeClient: std::fmt::Debug + Send + Sync {
    /// Hits the node's liveness endpoint. Any success status counts as alive.
    async fn check_liveness(&self, node: &Node) -> Result<(), ClientError>;

    /// Sends a generation request. For streamed requests the reply is a
    /// stream of newline-delimited chunks; nothing has been read from it yet.
    async fn generate(
        &self,
        node: &Node,
        request: &GenerationRequest,
    ) -> Result<NodeReply, ClientError>;
}

/// Body posted to a node's generation endpoint.
#[derive(Debug, Serialize)]
struct NodeGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a Map<String, Value>>,
}

/// Non-streamed reply. Ollama nodes answer in `response`, others in `content`.
#[derive(Debug, Deserialize)]
struct NodeGenerateReply {
    response: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpNodeClient<T: HttpClient> {
    http: T,
}

impl HttpNodeClient<HyperClient> {
    pub fn new(pool_idle_timeout: Duration, pool_max_idle_per_host: usize) -> Self {
        Self::with_client(create_hyper_client(pool_idle_timeout, pool_max_idle_per_host))
    }
}

impl<T: HttpClient> HttpNodeClient<T> {
    pub fn with_client(http: T) -> Self {
        Self { http }
    }

    async fn send(&self, req: axum::extract::Request) -> Result<axum::response::Response, ClientError> {
        let response = self
            .http
            .request(req)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

/// Resolves an endpoint path against the node address. The path is taken
/// relative to the address path, so `http://host/ollama` keeps its prefix.
fn endpoint_uri(node: &Node, path: &str) -> Result<String, ClientError> {
    let mut base = node.spec.address.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path.trim_start_matches('/'))
        .map(|url| url.to_string())
        .map_err(|e| ClientError::InvalidAddress(format!("{}{}: {}", node.spec.address, path, e)))
}

#[async_trait]
impl<T: HttpClient> NodeClient for HttpNodeClient<T> {
    async fn check_liveness(&self, node: &Node) -> Result<(), ClientError> {
        let uri = endpoint_uri(node, &node.spec.endpoints.health)?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Body::empty())
            .map_err(|e| ClientError::InvalidAddress(format!("{uri}: {e}")))?;

        self.send(req).await.map(|_| ())
    }

    async fn generate(
        &self,
        node: &Node,
        request: &GenerationRequest,
    ) -> Result<NodeReply, ClientError> {
        let uri = endpoint_uri(node, &node.spec.endpoints.generate)?;
        let body = serde_json::to_vec(&NodeGenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: request.stream,
            options: request.options.as_ref(),
        })
        .map_err(|e| ClientError::InvalidResponse(format!("cannot encode request: {e}")))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| ClientError::InvalidAddress(format!("{uri}: {e}")))?;

        let response = self.send(req).await?;

        if request.stream {
            let chunks = response
                .into_body()
                .into_data_stream()
                .map(|chunk| chunk.map_err(|e| ClientError::Connection(e.to_string())));
            return Ok(NodeReply::Stream(LineBufferedStream::new(chunks, MAX_REPLY_BYTES).boxed()));
        }

        let bytes = axum::body::to_bytes(response.into_body(), MAX_REPLY_BYTES)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let reply: NodeGenerateReply = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        reply
            .response
            .or(reply.content)
            .map(NodeReply::Complete)
            .ok_or_else(|| {
                ClientError::InvalidResponse("reply has neither 'response' nor 'content'".to_string())
            })
    }
}
