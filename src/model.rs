//! Conversation data model shared by every provider.
//!
//! A conversation is an ordered, append-only `Vec<Message>`. The order is the literal
//! transcript sent back to the provider, so nothing in this crate ever reorders or
//! rewrites it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::ops::AddAssign;

/// A single conversation turn.
///
/// Serializes adjacently tagged, e.g. `{"role": "user", "content": "Hi"}`, so a history
/// can be persisted as JSON and replayed as the seed of a later call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", content = "content", rename_all = "snake_case")]
pub enum Message {
    /// Text written by the user.
    User(String),
    /// A model turn, possibly carrying tool requests or tool responses.
    Bot(BotMessage),
    /// System instructions.
    System(String),
    /// A failure recorded in place of a response. Terminates an orchestration loop.
    Error(String),
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User(content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::System(content.into())
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Message::Bot(BotMessage {
            content: content.into(),
            ..Default::default()
        })
    }

    pub fn error(content: impl Into<String>) -> Self {
        Message::Error(content.into())
    }

    /// Text content of the message, whatever its role.
    pub fn text(&self) -> &str {
        match self {
            Message::User(content) | Message::System(content) | Message::Error(content) => {
                content
            }
            Message::Bot(bot) => &bot.content,
        }
    }

    pub fn tool_requests(&self) -> &[ToolRequest] {
        match self {
            Message::Bot(bot) => &bot.tool_requests,
            _ => &[],
        }
    }

    pub fn tool_responses(&self) -> &[ToolResponse] {
        match self {
            Message::Bot(bot) => &bot.tool_responses,
            _ => &[],
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }
}

/// Body of a [`Message::Bot`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_requests: Vec<ToolRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_responses: Vec<ToolResponse>,
}

impl BotMessage {
    /// A bot turn carrying a single tool response.
    pub fn responding(response: ToolResponse) -> Self {
        Self {
            content: String::new(),
            tool_requests: Vec::new(),
            tool_responses: vec![response],
        }
    }
}

/// A request from the model to run a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Opaque correlation id supplied by the provider.
    pub id: String,
    pub name: String,
    /// Arguments, already parsed from the accumulated JSON text.
    pub arguments: Value,
}

/// The result of running a tool, correlated to its [`ToolRequest`] by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub data: String,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    OutputTokens,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    /// Map a provider's finish string. Unrecognized values read as `Stop`.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::OutputTokens,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

/// Token accounting.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        fn sum(a: Option<u32>, b: Option<u32>) -> Option<u32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        self.prompt_tokens = sum(self.prompt_tokens, rhs.prompt_tokens);
        self.completion_tokens = sum(self.completion_tokens, rhs.completion_tokens);
    }
}

/// Raw wire-level request/response pair, kept for logging and debugging only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub request: Value,
    pub response: Value,
}

/// A provider response for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// New messages produced by the model, in order.
    pub data: Vec<Message>,
    pub usage: Usage,
    pub finish: FinishReason,
    /// Raw request/response bodies when the client captured them.
    pub exchange: Option<Exchange>,
}

/// Correlation map of every tool request in `history` that has no later response with
/// the same id, keyed by id in the order the requests appear.
///
/// The whole history is scanned, not only the newest turn. A response only resolves a
/// request that precedes it; responses in the same message count as later. If an id is
/// requested twice the first request wins.
pub fn unresolved_tool_requests(history: &[Message]) -> IndexMap<String, ToolRequest> {
    let mut pending = IndexMap::new();
    let mut resolved: HashSet<&str> = HashSet::new();

    for message in history {
        for request in message.tool_requests() {
            let id = request.id.as_str();
            if !resolved.contains(id) && !pending.contains_key(id) {
                pending.insert(request.id.clone(), request.clone());
            }
        }
        for response in message.tool_responses() {
            if pending.shift_remove(response.id.as_str()).is_some() {
                resolved.insert(response.id.as_str());
            }
        }
    }
    pending
}
