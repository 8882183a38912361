//! HTTP handlers for the router.
//!
//! Errors from the core are turned into JSON bodies here; see
//! [`status_code`] for how each error kind maps onto an HTTP status.
use crate::AppState;
use crate::errors::{ExhaustionReason, RouterError};
use crate::models::{ErrorBody, GenerateBody, GenerateReply, ListNodesResponse, ProbeReport};
use crate::request::{GenerationRequest, GenerationResponse, ResponseBody};
use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, error, instrument};

/// Response header naming the node that served a request.
pub const NODE_USED_HEADER: &str = "x-node-used";

const NDJSON: &str = "application/x-ndjson";

pub fn status_code(error: &RouterError) -> StatusCode {
    match error {
        RouterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RouterError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        RouterError::DuplicateNode(_) => StatusCode::CONFLICT,
        RouterError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RouterError::AllNodesExhausted { reason, .. } => match reason {
            ExhaustionReason::NoEligibleNodes => StatusCode::SERVICE_UNAVAILABLE,
            ExhaustionReason::AllFailed => StatusCode::BAD_GATEWAY,
            ExhaustionReason::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        },
        RouterError::StreamInterrupted { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            error!(kind = self.kind(), "{}", self);
        } else {
            debug!(kind = self.kind(), "{}", self);
        }
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

/// The line sent in place of the rest of a stream that broke mid-way.
fn error_line(error: &RouterError) -> Bytes {
    let mut line = json!({ "error": ErrorBody::from(error) }).to_string();
    line.push('\n');
    Bytes::from(line)
}

#[instrument(skip(state, body))]
pub async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, RouterError> {
    let Json(body) = body.map_err(|e| RouterError::InvalidRequest(e.body_text()))?;
    let request = GenerationRequest::from(body);

    let GenerationResponse {
        node_used: node_id,
        latency,
        body,
    } = state.dispatcher.generate(request).await?;
    let node_used = HeaderValue::from_bytes(node_id.as_bytes())
        .map_err(|e| RouterError::Configuration(format!("node id is not a valid header: {e}")))?;

    match body {
        ResponseBody::Complete(content) => {
            let reply = GenerateReply {
                content,
                node_used: node_id,
                latency_ms: latency.as_millis() as u64,
            };
            let mut http = Json(reply).into_response();
            http.headers_mut().insert(NODE_USED_HEADER, node_used);
            Ok(http)
        }
        ResponseBody::Stream(stream) => {
            let lines = stream.map(|item| {
                Ok::<_, Infallible>(match item {
                    Ok(chunk) => chunk,
                    Err(e) => error_line(&e),
                })
            });
            let mut http = Response::new(Body::from_stream(lines));
            http.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
            http.headers_mut().insert(NODE_USED_HEADER, node_used);
            Ok(http)
        }
    }
}

#[instrument(skip(state))]
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListNodesResponse::from_nodes(
        &state.dispatcher.registry().list_nodes(),
    ))
}

#[instrument(skip(state))]
pub async fn probe_nodes(State(state): State<AppState>) -> Result<Json<ProbeReport>, RouterError> {
    let results = state.prober.probe_registry().await?;
    Ok(Json(ProbeReport {
        results: results.into_iter().collect(),
    }))
}

#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.stats().snapshot())
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "nodes": state.dispatcher.registry().len(),
    }))
}
