//! # tooltalk - Tool-calling conversations with LLM providers
//!
//! A provider-agnostic conversation client: send a history, let the model request tools,
//! run them locally and feed the results back until the model answers.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Bounded tool orchestration loop with per-call options
//! - Streaming with incremental delta detection over Server-Sent Events
//! - Job-style backends polled with exponential backoff
//! - Typed tools with JSON Schema derived from their input types
//!
//! ## Architecture
//!
//! 1. **Providers** act as factories to create Clients.
//! 2. **Clients** turn a message history into the model's next messages.
//! 3. **Agents** wrap Clients to run tools and loop until the conversation settles.
//!
//! ### Core Types
//!
//! - **`Provider`**: Factory trait for creating clients.
//! - **`Client`** / **`StreamingClient`**: Request and streamed access to a model.
//! - **`Agent`**: Tool orchestration over any client.
//! - **`DeltaDetector`**: Folds streamed fragments into lifecycle events.
//! - **`RunPoller`**: Awaits asynchronous jobs with bounded attempts.
//! - **`Message`**: Individual conversation entries.
//!
//! ## Example
//! ```no_run
//! use tooltalk::agent::{Agent, ChatOptions};
//! use tooltalk::providers::{OpenAi, Provider};
//! use tooltalk::tools::ToolDefinition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OpenAi::from_env()?;
//!     let agent = Agent::new(client);
//!
//!     let add = ToolDefinition::from_sync_fn(
//!         "add",
//!         "Add two integers",
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
//!             "required": ["a", "b"]
//!         }),
//!         |args| {
//!             let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
//!             Ok(sum.to_string())
//!         },
//!     );
//!
//!     let options = ChatOptions::new().with_tool(add);
//!     let outcome = agent.chat("What is 2+2?", &options).await;
//!     if let Some(message) = outcome.last_message() {
//!         println!("{}", message.text());
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod client;
pub mod delta;
pub mod http;
pub mod model;
pub mod options;
pub mod poller;
pub mod providers;
pub mod sse;
pub mod stream;
pub mod tools;

pub use agent::{Agent, ChatOptions, ChatOutcome, Completion, Conversation};
pub use client::{Client, ClientError, StreamingClient};
pub use delta::{DeltaDetector, DetectorEvent};
pub use model::{Message, Response, ToolRequest, ToolResponse};
pub use poller::{JobBackend, RunClient, RunPoller, RunStatus};
pub use stream::StreamEvent;
pub use tools::{ToolDefinition, ToolError};
