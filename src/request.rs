//! Generation requests and the responses the dispatcher hands back.
use crate::errors::RouterError;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// A single generation call. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    /// Total budget across all attempts. Falls back to the dispatcher default.
    pub deadline: Option<Duration>,
    /// Extra generation options forwarded to the node untouched.
    pub options: Option<Map<String, Value>>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            stream: false,
            deadline: None,
            options: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.model.trim().is_empty() {
            return Err(RouterError::InvalidRequest(
                "model must not be empty".to_string(),
            ));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(RouterError::InvalidRequest(
                "deadline must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Chunks forwarded to the caller once a streamed attempt has produced its first byte.
pub type ResponseStream = BoxStream<'static, Result<Bytes, RouterError>>;

pub enum ResponseBody {
    Complete(String),
    Stream(ResponseStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Complete(content) => f.debug_tuple("Complete").field(content).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(<chunks>)"),
        }
    }
}

#[derive(Debug)]
pub struct GenerationResponse {
    pub node_used: String,
    /// Time to completion, or to the first chunk for streamed replies.
    pub latency: Duration,
    pub body: ResponseBody,
}

impl GenerationResponse {
    /// The full content of a non-streamed reply.
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Complete(content) => Some(content),
            ResponseBody::Stream(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_model_is_rejected() {
        let err = GenerationRequest::new(" ", "hi").validate().unwrap_err();
        assert!(matches!(err, RouterError::InvalidRequest(_)));
    }

    #[test]
    fn test_zero_deadline_is_rejected() {
        let request = GenerationRequest::new("llama3", "hi").with_deadline(Duration::ZERO);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let request = GenerationRequest::new("llama3", "hi")
            .streaming()
            .with_deadline(Duration::from_secs(5));
        assert!(request.stream);
        assert_eq!(request.deadline, Some(Duration::from_secs(5)));
        assert!(request.validate().is_ok());
    }
}
