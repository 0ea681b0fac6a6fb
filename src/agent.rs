//! Agent struct for automatic tool execution with LLM providers.

use futures::{FutureExt, Stream, StreamExt};
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use crate::client::{Client, ClientError, StreamingClient, StreamingResponse};
use crate::delta::DeltaDetector;
use crate::model::{
    unresolved_tool_requests, BotMessage, Exchange, Message, ToolRequest, ToolResponse, Usage,
};
use crate::stream::{fragment_usage, StreamEvent, Translator};
use crate::tools::{ToolDefinition, ToolSpec};

/// Default bound on request rounds per call.
pub const DEFAULT_MAX_ITERATIONS: usize = 3;

/// Cooperative cancellation, checked only between rounds.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call orchestration options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Tools the model may invoke during this call.
    pub tools: Vec<ToolDefinition>,
    /// Upper bound on request rounds. At least one round always runs.
    pub max_iterations: usize,
    /// Re-query the model automatically after tools ran.
    pub auto_reply: bool,
    /// Persist new messages into a [`Conversation`]'s history.
    pub record: bool,
    /// Return each round's raw request/response bodies in [`ChatOutcome::exchanges`].
    pub capture_exchanges: bool,
    pub abort: Option<AbortHandle>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            auto_reply: true,
            record: true,
            capture_exchanges: false,
            abort: None,
        }
    }
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_auto_reply(mut self, auto_reply: bool) -> Self {
        self.auto_reply = auto_reply;
        self
    }

    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_capture_exchanges(mut self, capture: bool) -> Self {
        self.capture_exchanges = capture;
        self
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortHandle::is_aborted)
    }

    fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDefinition::spec).collect()
    }
}

/// What a chat call starts from: a single message or a whole history.
#[derive(Debug, Clone)]
pub enum ChatInput {
    Message(Message),
    History(Vec<Message>),
}

impl ChatInput {
    fn into_history(self) -> Vec<Message> {
        match self {
            ChatInput::Message(message) => vec![message],
            ChatInput::History(history) => history,
        }
    }
}

impl From<Message> for ChatInput {
    fn from(message: Message) -> Self {
        ChatInput::Message(message)
    }
}

impl From<Vec<Message>> for ChatInput {
    fn from(history: Vec<Message>) -> Self {
        ChatInput::History(history)
    }
}

impl From<&str> for ChatInput {
    fn from(text: &str) -> Self {
        ChatInput::Message(Message::user(text))
    }
}

/// How an orchestration loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The model's last turn needed no tools.
    Complete,
    /// Tools ran in the last round but the model was not asked to reply, because
    /// `max_iterations` was reached or `auto_reply` is off.
    Incomplete { awaiting_reply: Vec<ToolResponse> },
    /// The abort handle fired before a round started.
    Aborted,
    /// A round failed and an error message ended the history.
    Failed(String),
}

/// Result of [`Agent::chat`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOutcome {
    /// The full working history: the input followed by everything appended.
    pub history: Vec<Message>,
    /// Raw per-round request/response bodies, when captured.
    pub exchanges: Vec<Exchange>,
    pub usage: Usage,
    pub rounds: usize,
    pub completion: Completion,
}

impl ChatOutcome {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }

    /// Tool requests in the history still lacking a response.
    pub fn unresolved(&self) -> IndexMap<String, ToolRequest> {
        unresolved_tool_requests(&self.history)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.last()
    }
}

/// Agent that automatically executes tools in a loop.
///
/// Each round:
/// 1. Sends the working history and tool definitions to the client
/// 2. Appends the response, or an error message if the request failed
/// 3. Runs every tool request in the history that has no response yet
/// 4. Loops while tools ran, `auto_reply` is on and rounds remain
///
/// The history only ever grows. A request that already has a response is never run
/// again, and neither transport nor tool failures escape the loop.
///
/// # Example
/// ```ignore
/// let agent = Agent::new(OpenAi::create(api_key, "gpt-4o-mini".into()));
/// let options = ChatOptions::new().with_tool(add_tool);
///
/// let outcome = agent.chat("What is 2+2?", &options).await;
/// println!("{}", outcome.last_message().map(Message::text).unwrap_or_default());
/// ```
pub struct Agent<C> {
    client: C,
    span: tracing::Span,
}

impl<C> Agent<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            span: tracing::info_span!("agent"),
        }
    }

    /// Log inside `span` instead of the agent's own span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: Client> Agent<C> {
    /// Run the orchestration loop and return the resulting history.
    pub async fn chat(&self, input: impl Into<ChatInput>, options: &ChatOptions) -> ChatOutcome {
        let history = input.into().into_history();
        self.run(history, options).instrument(self.span.clone()).await
    }

    async fn run(&self, mut history: Vec<Message>, options: &ChatOptions) -> ChatOutcome {
        debug!(
            "Starting agent chat loop with {} initial messages",
            history.len()
        );

        let specs = options.specs();
        let mut exchanges = Vec::new();
        let mut usage = Usage::default();
        let mut rounds = 0;

        let completion = loop {
            if options.aborted() {
                info!("Agent loop aborted after {} rounds", rounds);
                break Completion::Aborted;
            }

            rounds += 1;
            debug!("Agent iteration {}/{}", rounds, options.max_iterations);

            match self.client.request(history.clone(), specs.clone()).await {
                Ok(response) => {
                    usage += response.usage;
                    if options.capture_exchanges {
                        exchanges.extend(response.exchange);
                    }
                    history.extend(response.data);
                }
                Err(e) => {
                    warn!("Request failed in round {}: {}", rounds, e);
                    let description = e.to_string();
                    history.push(Message::error(description.clone()));
                    break Completion::Failed(description);
                }
            }

            let responses = resolve_tools(&mut history, &options.tools).await;
            if let Some(completion) = next_step(responses, rounds, options) {
                break completion;
            }
        };

        ChatOutcome {
            history,
            exchanges,
            usage,
            rounds,
            completion,
        }
    }
}

impl<C: StreamingClient> Agent<C> {
    /// Streaming variant of [`chat`](Self::chat).
    ///
    /// Every round streams through a fresh [`DeltaDetector`]; translated events are
    /// forwarded as they arrive, followed by the tool responses of that round. The last
    /// event is always [`StreamEvent::Done`].
    pub fn chat_stream<'a>(
        &'a self,
        input: impl Into<ChatInput>,
        options: &'a ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>> {
        let mut history = input.into().into_history();

        Box::pin(async_stream::stream! {
            let span = self.span.clone();
            debug!(
                parent: &span,
                "Starting agent streaming chat loop with {} initial messages",
                history.len()
            );

            let specs = options.specs();
            let mut exchanges = Vec::new();
            let mut usage = Usage::default();
            let mut rounds = 0;

            let completion = loop {
                if options.aborted() {
                    info!(parent: &span, "Agent streaming loop aborted after {} rounds", rounds);
                    break Completion::Aborted;
                }

                rounds += 1;
                debug!(parent: &span, "Agent streaming iteration {}/{}", rounds, options.max_iterations);

                let opened = self
                    .client
                    .request_stream(history.clone(), specs.clone())
                    .instrument(span.clone())
                    .await;
                let StreamingResponse { request, mut fragments } = match opened {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(parent: &span, "Stream request failed in round {}: {}", rounds, e);
                        let description = e.to_string();
                        history.push(Message::error(description.clone()));
                        yield StreamEvent::Error(description.clone());
                        break Completion::Failed(description);
                    }
                };

                let mut detector = DeltaDetector::new().with_span(span.clone());
                let mut translator = Translator::new();
                let mut raw_fragments = Vec::new();
                let mut failure = None;

                while let Some(item) = fragments.next().await {
                    let raw = match item {
                        Ok(raw) => raw,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    };

                    match detector.scan(&raw) {
                        Ok(events) => {
                            for event in events {
                                yield translator.translate(event);
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }

                    if let Some(reported) = fragment_usage(&raw) {
                        usage += reported.clone();
                        yield StreamEvent::Usage(reported);
                    }
                    if options.capture_exchanges {
                        raw_fragments.push(raw);
                    }
                }

                if failure.is_none() {
                    let unfinished = detector.unfinished();
                    if !unfinished.is_empty() {
                        failure = Some(ClientError::Incomplete(format!(
                            "stream ended before choices {} finished",
                            unfinished.iter().join(", ")
                        )));
                    }
                }

                if options.capture_exchanges {
                    exchanges.push(Exchange {
                        request,
                        response: Value::Array(raw_fragments),
                    });
                }

                if let Some(e) = failure {
                    warn!(parent: &span, "Stream failed in round {}: {}", rounds, e);
                    let description = e.to_string();
                    history.push(Message::error(description.clone()));
                    yield StreamEvent::Error(description.clone());
                    break Completion::Failed(description);
                }

                history.extend(translator.into_messages());

                let responses = resolve_tools(&mut history, &options.tools)
                    .instrument(span.clone())
                    .await;
                for response in &responses {
                    yield StreamEvent::ToolResponse(response.clone());
                }

                if let Some(completion) = next_step(responses, rounds, options) {
                    break completion;
                }
            };

            yield StreamEvent::Done(ChatOutcome {
                history,
                exchanges,
                usage,
                rounds,
                completion,
            });
        })
    }
}

/// Decide whether the loop continues after a round. `None` means run another round.
fn next_step(responses: Vec<ToolResponse>, rounds: usize, options: &ChatOptions) -> Option<Completion> {
    if responses.is_empty() {
        debug!("No pending tool requests, agent loop complete");
        return Some(Completion::Complete);
    }
    if !options.auto_reply {
        debug!("Auto-reply disabled, returning {} tool responses", responses.len());
        return Some(Completion::Incomplete {
            awaiting_reply: responses,
        });
    }
    if rounds >= options.max_iterations {
        warn!(
            "Max iterations ({}) reached with unanswered tool responses: {}",
            options.max_iterations,
            responses.iter().map(|r| &r.id).join(", ")
        );
        return Some(Completion::Incomplete {
            awaiting_reply: responses,
        });
    }
    None
}

/// Run every unresolved tool request in `history`, in discovery order, appending one
/// response message per request. Returns the responses appended.
async fn resolve_tools(history: &mut Vec<Message>, tools: &[ToolDefinition]) -> Vec<ToolResponse> {
    let pending = unresolved_tool_requests(history);
    let mut responses = Vec::with_capacity(pending.len());

    for (_, request) in pending {
        let response = run_tool(&request, tools).await;
        history.push(Message::Bot(BotMessage::responding(response.clone())));
        responses.push(response);
    }
    responses
}

/// Execute one request. Unknown tools and handler failures become response data.
async fn run_tool(request: &ToolRequest, tools: &[ToolDefinition]) -> ToolResponse {
    let data = match tools.iter().find(|tool| tool.id == request.name) {
        None => {
            warn!("Model requested unknown tool: {}", request.name);
            json!({"error": format!("Unknown tool: {}", request.name)}).to_string()
        }
        Some(tool) => {
            info!("Tool call requested: {}", request.name);
            debug!("Tool arguments: {}", request.arguments);

            let call = AssertUnwindSafe(tool.call(request.arguments.clone())).catch_unwind();
            match call.await {
                Ok(Ok(data)) => {
                    info!("Tool {} executed successfully", request.name);
                    debug!("Tool result: {}", data);
                    data
                }
                Ok(Err(e)) => {
                    warn!("Tool {} execution failed: {}", request.name, e);
                    json!({"error": e.to_string()}).to_string()
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    warn!("Tool {} panicked: {}", request.name, reason);
                    json!({"error": format!("Tool panicked: {}", reason)}).to_string()
                }
            }
        }
    };

    ToolResponse {
        id: request.id.clone(),
        name: request.name.clone(),
        data,
    }
}

/// A conversation session: an [`Agent`] plus a history that persists across calls.
pub struct Conversation<C> {
    agent: Agent<C>,
    options: ChatOptions,
    history: Vec<Message>,
}

impl<C: Client> Conversation<C> {
    pub fn new(agent: Agent<C>, options: ChatOptions) -> Self {
        Self {
            agent,
            options,
            history: Vec::new(),
        }
    }

    /// Seed the session with a previously persisted history.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn options_mut(&mut self) -> &mut ChatOptions {
        &mut self.options
    }

    /// Send a message on top of the session history.
    ///
    /// With `record` enabled the session history becomes the outcome's history;
    /// otherwise the session is left untouched.
    pub async fn send(&mut self, message: Message) -> ChatOutcome {
        let mut working = self.history.clone();
        working.push(message);

        let outcome = self.agent.chat(working, &self.options).await;
        if self.options.record {
            self.history.clone_from(&outcome.history);
        }
        outcome
    }
}
