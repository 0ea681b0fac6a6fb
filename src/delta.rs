//! Incremental detection of lifecycle events in a streamed completion.
//!
//! Providers stream a completion as many small fragments. Each fragment carries, per
//! choice, an optional text increment, optional tool-call increments and an optional
//! finish marker. [`DeltaDetector`] folds these into per-choice accumulators and emits a
//! fixed sequence of [`DetectorEvent`]s:
//!
//! ```text
//! Start -> (Chunk, Collect)* -> ToolStart* -> ToolFinish* -> Finish
//! ```
//!
//! Within one fragment entry, content events come before tool events, and tool events
//! before terminal events. Tool-call argument text is only parsed once, when its choice
//! finishes.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::ClientError;
use crate::model::{FinishReason, ToolRequest};

/// One streamed completion fragment, in the shape the detector understands.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub choices: Vec<ChoiceDelta>,
}

/// Increment for one choice.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChoiceDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Increment for one tool call, keyed by an index local to its choice.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "object")]
enum TaggedFragment {
    #[serde(rename = "chat.completion.chunk")]
    Chunk(Fragment),
}

impl Fragment {
    /// Decode a raw provider object. Anything that is not a streamed completion chunk
    /// yields `None`; that is an ordinary "ignore", not an error.
    pub fn decode(raw: &Value) -> Option<Fragment> {
        match TaggedFragment::deserialize(raw) {
            Ok(TaggedFragment::Chunk(fragment)) => Some(fragment),
            Err(_) => None,
        }
    }
}

/// Accumulated state of one tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallAccumulator {
    pub id: String,
    pub name: String,
    /// Raw concatenated argument text. Not parsed until the choice finishes.
    pub arguments_text: String,
}

impl ToolCallAccumulator {
    fn append(&mut self, delta: &ToolCallDelta) {
        if self.id.is_empty() {
            if let Some(id) = &delta.id {
                self.id.push_str(id);
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                self.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                self.arguments_text.push_str(arguments);
            }
        }
    }

    /// Parse the accumulated argument text. Empty text reads as an empty object.
    fn finalize(&self) -> Result<ToolRequest, ClientError> {
        let id = if self.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            self.id.clone()
        };

        let arguments = if self.arguments_text.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.arguments_text).map_err(|source| {
                ClientError::MalformedToolArguments {
                    id: id.clone(),
                    name: self.name.clone(),
                    source,
                }
            })?
        };

        Ok(ToolRequest {
            id,
            name: self.name.clone(),
            arguments,
        })
    }
}

/// Accumulated state of one choice.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaCollection {
    pub content: String,
    pub role: String,
    /// Tool calls keyed by their local index.
    pub tool_calls: BTreeMap<usize, ToolCallAccumulator>,
    pub finished: bool,
}

impl Default for DeltaCollection {
    fn default() -> Self {
        Self {
            content: String::new(),
            role: "assistant".to_string(),
            tool_calls: BTreeMap::new(),
            finished: false,
        }
    }
}

/// Lifecycle events emitted by [`DeltaDetector`].
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// First fragment seen for a choice.
    Start { choice: usize },
    /// The raw text increment, possibly empty.
    Chunk { choice: usize, delta: String },
    /// The choice's full text so far.
    Collect { choice: usize, content: String },
    /// First fragment seen for a tool call. `name` may still be partial.
    ToolStart {
        choice: usize,
        index: usize,
        id: String,
        name: String,
    },
    /// A tool call whose arguments parsed successfully.
    ToolFinish {
        choice: usize,
        index: usize,
        call: ToolRequest,
    },
    /// The choice is complete.
    Finish {
        choice: usize,
        content: String,
        tool_calls: Vec<ToolRequest>,
        reason: FinishReason,
    },
}

impl DetectorEvent {
    pub fn choice(&self) -> usize {
        match self {
            DetectorEvent::Start { choice }
            | DetectorEvent::Chunk { choice, .. }
            | DetectorEvent::Collect { choice, .. }
            | DetectorEvent::ToolStart { choice, .. }
            | DetectorEvent::ToolFinish { choice, .. }
            | DetectorEvent::Finish { choice, .. } => *choice,
        }
    }
}

type Listener = Box<dyn FnMut(DetectorEvent) + Send>;

/// Folds streamed fragments into per-choice accumulators and emits [`DetectorEvent`]s.
///
/// `scan` must be called once per fragment in wire order. Each event is cloned for every
/// listener, so listeners never share state with the detector or with each other.
pub struct DeltaDetector {
    collections: BTreeMap<usize, DeltaCollection>,
    listeners: Vec<Listener>,
    span: tracing::Span,
}

impl Default for DeltaDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaDetector {
    pub fn new() -> Self {
        Self {
            collections: BTreeMap::new(),
            listeners: Vec::new(),
            span: tracing::debug_span!("delta_detector"),
        }
    }

    /// Log inside `span` instead of the detector's own span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Register a consumer of every emitted event.
    pub fn listen(&mut self, listener: impl FnMut(DetectorEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Register a channel consumer of every emitted event.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DetectorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listen(move |event| {
            // A dropped receiver just stops listening.
            let _ = tx.send(event);
        });
        rx
    }

    pub fn collection(&self, choice: usize) -> Option<&DeltaCollection> {
        self.collections.get(&choice)
    }

    pub fn collections(&self) -> impl Iterator<Item = (usize, &DeltaCollection)> {
        self.collections.iter().map(|(choice, c)| (*choice, c))
    }

    /// Choices that started but never received a finish marker.
    pub fn unfinished(&self) -> Vec<usize> {
        self.collections
            .iter()
            .filter(|(_, c)| !c.finished)
            .map(|(choice, _)| *choice)
            .collect()
    }

    /// Scan a raw provider object. Unrecognized objects are ignored.
    ///
    /// Returns the events emitted for this fragment, in emission order. Fails only when a
    /// finished tool call's argument text is not valid JSON.
    pub fn scan(&mut self, raw: &Value) -> Result<Vec<DetectorEvent>, ClientError> {
        match Fragment::decode(raw) {
            Some(fragment) => self.scan_fragment(&fragment),
            None => {
                let _guard = self.span.enter();
                trace!("Ignoring unrecognized fragment");
                Ok(Vec::new())
            }
        }
    }

    /// Scan an already decoded fragment.
    pub fn scan_fragment(&mut self, fragment: &Fragment) -> Result<Vec<DetectorEvent>, ClientError> {
        let span = self.span.clone();
        let _guard = span.enter();

        let mut events = Vec::new();
        for entry in &fragment.choices {
            self.scan_choice(entry, &mut events)?;
        }
        Ok(events)
    }

    fn scan_choice(
        &mut self,
        entry: &ChoiceDelta,
        events: &mut Vec<DetectorEvent>,
    ) -> Result<(), ClientError> {
        let choice = entry.index;

        if !self.collections.contains_key(&choice) {
            debug!(choice, "Choice started");
            self.collections.insert(choice, DeltaCollection::default());
            self.emit(events, DetectorEvent::Start { choice });
        }

        if self.collections.get(&choice).is_some_and(|c| c.finished) {
            debug!(choice, "Ignoring fragment for finished choice");
            return Ok(());
        }

        if let Some(delta) = &entry.delta {
            if let Some(role) = &delta.role {
                if let Some(collection) = self.collections.get_mut(&choice) {
                    collection.role.clone_from(role);
                }
            }

            if let Some(text) = &delta.content {
                let content = match self.collections.get_mut(&choice) {
                    Some(collection) => {
                        collection.content.push_str(text);
                        collection.content.clone()
                    }
                    None => return Ok(()),
                };
                self.emit(
                    events,
                    DetectorEvent::Chunk {
                        choice,
                        delta: text.clone(),
                    },
                );
                self.emit(events, DetectorEvent::Collect { choice, content });
            }

            for call in delta.tool_calls.iter().flatten() {
                self.scan_tool_call(choice, call, events);
            }
        }

        if let Some(reason) = &entry.finish_reason {
            self.finish_choice(choice, FinishReason::from_wire(reason), events)?;
        }

        Ok(())
    }

    fn scan_tool_call(&mut self, choice: usize, call: &ToolCallDelta, events: &mut Vec<DetectorEvent>) {
        let Some(collection) = self.collections.get_mut(&choice) else {
            return;
        };

        let started = !collection.tool_calls.contains_key(&call.index);
        let accumulator = collection.tool_calls.entry(call.index).or_default();
        accumulator.append(call);

        if started {
            let event = DetectorEvent::ToolStart {
                choice,
                index: call.index,
                id: accumulator.id.clone(),
                name: accumulator.name.clone(),
            };
            debug!(choice, index = call.index, name = %accumulator.name, "Tool call started");
            self.emit(events, event);
        }
    }

    fn finish_choice(
        &mut self,
        choice: usize,
        reason: FinishReason,
        events: &mut Vec<DetectorEvent>,
    ) -> Result<(), ClientError> {
        let Some(collection) = self.collections.get_mut(&choice) else {
            return Ok(());
        };
        collection.finished = true;

        // Every call is parsed before anything is emitted, so a malformed one leaves
        // listeners without a partial tool sequence.
        let finalized = collection
            .tool_calls
            .iter()
            .map(|(index, acc)| acc.finalize().map(|call| (*index, call)))
            .collect::<Result<Vec<_>, _>>()?;
        let content = collection.content.clone();

        let mut tool_calls = Vec::with_capacity(finalized.len());
        for (index, call) in finalized {
            debug!(choice, index, name = %call.name, "Tool call finished");
            tool_calls.push(call.clone());
            self.emit(events, DetectorEvent::ToolFinish { choice, index, call });
        }

        debug!(choice, ?reason, "Choice finished");
        self.emit(
            events,
            DetectorEvent::Finish {
                choice,
                content,
                tool_calls,
                reason,
            },
        );
        Ok(())
    }

    fn emit(&mut self, events: &mut Vec<DetectorEvent>, event: DetectorEvent) {
        for listener in &mut self.listeners {
            listener(event.clone());
        }
        events.push(event);
    }
}
