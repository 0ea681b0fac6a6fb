//! Public streaming vocabulary and assembly of streamed turns into history.

use futures::{Stream, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::agent::ChatOutcome;
use crate::client::{ClientError, FragmentStream};
use crate::delta::{DeltaDetector, DetectorEvent};
use crate::model::{BotMessage, FinishReason, Message, ToolRequest, ToolResponse, Usage};

/// Events surfaced to callers while a response streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A new model turn began for `choice`.
    MessageStart { choice: usize },
    /// Raw text increment.
    TextDelta { choice: usize, delta: String },
    /// Full text of the turn so far.
    Text { choice: usize, text: String },
    /// The model began a tool request. The name may be partial.
    ToolRequestStart {
        choice: usize,
        id: String,
        name: String,
    },
    /// A tool request with fully parsed arguments.
    ToolRequest { choice: usize, request: ToolRequest },
    /// The turn for `choice` is complete.
    Message {
        choice: usize,
        message: Message,
        reason: FinishReason,
    },
    /// Token usage reported by the provider.
    Usage(Usage),
    /// A tool ran (or was rejected) and its response was appended to history.
    ToolResponse(ToolResponse),
    /// An error message was appended to history.
    Error(String),
    /// The orchestration loop ended.
    Done(ChatOutcome),
}

/// Maps detector events onto [`StreamEvent`]s and assembles finished turns.
#[derive(Debug, Default)]
pub struct Translator {
    finished: BTreeMap<usize, Message>,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: DetectorEvent) -> StreamEvent {
        match event {
            DetectorEvent::Start { choice } => StreamEvent::MessageStart { choice },
            DetectorEvent::Chunk { choice, delta } => StreamEvent::TextDelta { choice, delta },
            DetectorEvent::Collect { choice, content } => StreamEvent::Text {
                choice,
                text: content,
            },
            DetectorEvent::ToolStart {
                choice, id, name, ..
            } => StreamEvent::ToolRequestStart { choice, id, name },
            DetectorEvent::ToolFinish { choice, call, .. } => StreamEvent::ToolRequest {
                choice,
                request: call,
            },
            DetectorEvent::Finish {
                choice,
                content,
                tool_calls,
                reason,
            } => {
                let message = Message::Bot(BotMessage {
                    content,
                    tool_requests: tool_calls,
                    tool_responses: Vec::new(),
                });
                self.finished.insert(choice, message.clone());
                StreamEvent::Message {
                    choice,
                    message,
                    reason,
                }
            }
        }
    }

    /// Turns finished so far, ordered by choice index.
    pub fn into_messages(self) -> Vec<Message> {
        self.finished.into_values().collect()
    }
}

/// Token usage carried by a raw fragment, if any.
pub fn fragment_usage(raw: &Value) -> Option<Usage> {
    raw.get("usage")
        .filter(|usage| !usage.is_null())
        .and_then(|usage| serde_json::from_value(usage.clone()).ok())
}

/// Run a single streamed response through a fresh detector and translator.
///
/// Transport errors and malformed tool-call arguments end the stream with `Err`.
pub fn translate(
    fragments: FragmentStream,
) -> impl Stream<Item = Result<StreamEvent, ClientError>> + Send {
    async_stream::try_stream! {
        let mut fragments = fragments;
        let mut detector = DeltaDetector::new();
        let mut translator = Translator::new();

        while let Some(raw) = fragments.next().await {
            let raw = raw?;
            for event in detector.scan(&raw)? {
                yield translator.translate(event);
            }
            if let Some(usage) = fragment_usage(&raw) {
                yield StreamEvent::Usage(usage);
            }
        }

        let unfinished = detector.unfinished();
        if !unfinished.is_empty() {
            Err(ClientError::Incomplete(format!(
                "stream ended before choices {} finished",
                unfinished.iter().join(", ")
            )))?;
        }
    }
}
