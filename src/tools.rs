//! Caller-supplied tools the model may invoke mid-conversation.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool error: {0}")]
    Error(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
}

impl ToolError {
    pub fn msg(message: impl fmt::Display) -> Self {
        ToolError::Error(message.to_string())
    }
}

/// Executes a tool. Handlers may be synchronous or asynchronous; both are awaited.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<String, ToolError>;
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for AsyncFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ToolError>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        (self.0)(arguments).await
    }
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> ToolHandler for SyncFn<F>
where
    F: Fn(Value) -> Result<String, ToolError> + Send + Sync,
{
    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        (self.0)(arguments)
    }
}

/// Handler-less description of a tool, as sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A named function the model may call.
///
/// Owned by the caller and passed per conversation round; the library never stores it.
#[derive(Clone)]
pub struct ToolDefinition {
    pub id: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
        }
    }

    /// Tool backed by an async closure.
    pub fn from_fn<F, Fut>(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Self::new(id, description, input_schema, AsyncFn(f))
    }

    /// Tool backed by a plain closure.
    pub fn from_sync_fn<F>(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Result<String, ToolError> + Send + Sync + 'static,
    {
        Self::new(id, description, input_schema, SyncFn(f))
    }

    /// Tool whose input schema is derived from `I` and whose arguments are
    /// deserialized into `I` before the closure runs.
    ///
    /// # Example
    /// ```
    /// use schemars::JsonSchema;
    /// use serde::Deserialize;
    /// use tooltalk::tools::ToolDefinition;
    ///
    /// #[derive(Deserialize, JsonSchema)]
    /// struct Add {
    ///     a: i64,
    ///     b: i64,
    /// }
    ///
    /// let add = ToolDefinition::typed("add", "Add two integers", |input: Add| async move {
    ///     Ok((input.a + input.b).to_string())
    /// });
    /// assert_eq!(add.input_schema["properties"]["a"]["type"], "integer");
    /// ```
    pub fn typed<I, F, Fut>(id: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let input_schema = serde_json::to_value(schemars::schema_for!(I)).unwrap_or_default();
        Self::from_fn(id, description, input_schema, move |arguments: Value| {
            let call = serde_json::from_value::<I>(arguments).map(&f);
            async move {
                match call {
                    Ok(fut) => fut.await,
                    Err(e) => Err(ToolError::InvalidArguments(e)),
                }
            }
        })
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.id.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }

    pub async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        self.handler.call(arguments).await
    }
}
