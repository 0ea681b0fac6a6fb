//! Provider boundary traits and error types.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;

use crate::model::{Message, Response};
use crate::tools::ToolSpec;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A finished tool call whose accumulated argument text is not valid JSON.
    #[error("Malformed arguments for tool call {id} ({name}): {source}")]
    MalformedToolArguments {
        id: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Work was accepted but never reached a terminal state.
    #[error("Incomplete: {0}")]
    Incomplete(String),
}

/// Raw provider fragments, in wire order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Value, ClientError>> + Send>>;

/// An open streamed response.
pub struct StreamingResponse {
    /// The request body that opened the stream.
    pub request: Value,
    pub fragments: FragmentStream,
}

/// Request/response access to an LLM provider.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send the conversation so far and return the model's new messages.
    async fn request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<Response, ClientError>;
}

/// Extension trait for streaming support.
#[async_trait]
pub trait StreamingClient: Client {
    /// Open a streamed completion. Fragments are surfaced undecoded; the
    /// [`DeltaDetector`](crate::delta::DeltaDetector) decides which ones it recognizes.
    async fn request_stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<StreamingResponse, ClientError>;
}
