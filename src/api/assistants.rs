//! OpenAI Assistants API backend.
//!
//! Completions run as asynchronous jobs: a thread and run are created in one call, the
//! run is polled, and the thread's messages are read once it settles. Tool calls surface
//! as a `requires_action` run whose outputs are submitted on the next request.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::client::ClientError;
use crate::http::{add_extra_headers, build_http_client, RequestBuilderExt, ResponseExt};
use crate::model::{BotMessage, FinishReason, Message, Response, ToolRequest, Usage};
use crate::options::TransportOptions;
use crate::poller::{JobBackend, RunHandle, RunState, RunStatus};
use crate::tools::ToolSpec;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// A run paused on `requires_action`, waiting for tool outputs.
#[derive(Debug, Clone, PartialEq)]
struct PendingRun {
    thread_id: String,
    run_id: String,
    call_ids: Vec<String>,
}

/// [`JobBackend`] for a configured assistant.
#[derive(Debug)]
pub struct AssistantsBackend {
    api_key: String,
    base_url: String,
    assistant_id: String,
    model: Option<String>,
    transport_options: TransportOptions,
    pending: Mutex<Option<PendingRun>>,
}

impl AssistantsBackend {
    pub fn new(api_key: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            assistant_id: assistant_id.into(),
            model: None,
            transport_options: TransportOptions::default(),
            pending: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the assistant's configured model for every run.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into()).filter(|m| !m.is_empty());
        self
    }

    pub fn with_transport(mut self, transport_options: TransportOptions) -> Self {
        self.transport_options = transport_options;
        self
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    fn pending(&self) -> Option<PendingRun> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_pending(&self, run: Option<PendingRun>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = run;
    }

    fn builder(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        let http_client = build_http_client(&self.transport_options)?;
        let req = http_client
            .request(method, format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .header(BETA_HEADER.0, BETA_HEADER.1);
        Ok(add_extra_headers(req, &self.transport_options))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let response = self
            .builder(reqwest::Method::POST, path)?
            .json_logged(body)
            .send()
            .await?;
        response.error_for_status_logged().await?.json_logged().await
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let response = self.builder(reqwest::Method::GET, path)?.send().await?;
        response.error_for_status_logged().await?.json_logged().await
    }

    fn create_body(&self, messages: &[Message], tools: Vec<ToolSpec>) -> Value {
        let mut instructions = Vec::new();
        let mut thread_messages = Vec::new();
        for message in messages {
            match message {
                Message::System(text) => instructions.push(text.as_str()),
                Message::User(text) => thread_messages.push(ThreadMessage {
                    role: "user",
                    content: text.clone(),
                }),
                Message::Bot(bot) if !bot.content.is_empty() => thread_messages.push(ThreadMessage {
                    role: "assistant",
                    content: bot.content.clone(),
                }),
                // Tool traffic from earlier runs lives in their threads.
                Message::Bot(_) | Message::Error(_) => {}
            }
        }

        let mut body = json!({
            "assistant_id": self.assistant_id,
            "thread": { "messages": thread_messages },
        });
        if !instructions.is_empty() {
            body["instructions"] = Value::String(instructions.join("\n\n"));
        }
        if let Some(model) = &self.model {
            body["model"] = Value::String(model.clone());
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .into_iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.input_schema,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

/// Tool outputs in `messages` for every call the pending run is waiting on, or `None`
/// if any call is still unanswered.
fn tool_outputs_for(pending: &PendingRun, messages: &[Message]) -> Option<Vec<ToolOutput>> {
    pending
        .call_ids
        .iter()
        .map(|id| {
            messages
                .iter()
                .rev()
                .flat_map(Message::tool_responses)
                .find(|response| &response.id == id)
                .map(|response| ToolOutput {
                    tool_call_id: id.clone(),
                    output: response.data.clone(),
                })
        })
        .collect()
}

#[async_trait]
impl JobBackend for AssistantsBackend {
    async fn create_job(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<RunHandle, ClientError> {
        if let Some(pending) = self.pending() {
            if let Some(tool_outputs) = tool_outputs_for(&pending, &messages) {
                debug!(
                    "Submitting {} tool outputs to run {}",
                    tool_outputs.len(),
                    pending.run_id
                );
                let request = json!({ "tool_outputs": tool_outputs });
                let path = format!(
                    "/threads/{}/runs/{}/submit_tool_outputs",
                    pending.thread_id, pending.run_id
                );
                let run: RunObject = serde_json::from_value(self.post(&path, &request).await?)?;
                self.set_pending(None);
                return Ok(RunHandle {
                    run_id: run.id,
                    thread_id: run.thread_id,
                    request,
                });
            }
            debug!("Abandoning run {} with unanswered tool calls", pending.run_id);
            self.set_pending(None);
        }

        let request = self.create_body(&messages, tools);
        let run: RunObject = serde_json::from_value(self.post("/threads/runs", &request).await?)?;
        debug!("Created run {} on thread {}", run.id, run.thread_id);
        Ok(RunHandle {
            run_id: run.id,
            thread_id: run.thread_id,
            request,
        })
    }

    async fn get_status(&self, handle: &RunHandle) -> Result<RunState, ClientError> {
        let detail = self
            .get(&format!("/threads/{}/runs/{}", handle.thread_id, handle.run_id))
            .await?;
        let run: RunObject = serde_json::from_value(detail.clone())?;
        Ok(RunState {
            run_id: run.id,
            thread_id: run.thread_id,
            status: run.status,
            detail,
        })
    }

    async fn fetch_result(&self, state: &RunState) -> Result<Response, ClientError> {
        let usage = state
            .detail
            .get("usage")
            .filter(|u| u.is_object())
            .map(|u| serde_json::from_value::<Usage>(u.clone()))
            .transpose()?
            .unwrap_or_default();

        if state.status == RunStatus::RequiresAction {
            let calls: Vec<RunToolCall> = state
                .detail
                .pointer("/required_action/submit_tool_outputs/tool_calls")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            let tool_requests = calls
                .into_iter()
                .map(ToolRequest::try_from)
                .collect::<Result<Vec<_>, _>>()?;

            self.set_pending(Some(PendingRun {
                thread_id: state.thread_id.clone(),
                run_id: state.run_id.clone(),
                call_ids: tool_requests.iter().map(|r| r.id.clone()).collect(),
            }));

            return Ok(Response {
                data: vec![Message::Bot(BotMessage {
                    content: String::new(),
                    tool_requests,
                    tool_responses: Vec::new(),
                })],
                usage,
                finish: FinishReason::ToolCalls,
                exchange: None,
            });
        }

        let list: MessageList = serde_json::from_value(
            self.get(&format!(
                "/threads/{}/messages?run_id={}&order=asc",
                state.thread_id, state.run_id
            ))
            .await?,
        )?;

        let data = list
            .data
            .into_iter()
            .filter(|m| m.role == "assistant")
            .map(|m| {
                let text: String = m
                    .content
                    .into_iter()
                    .filter_map(|part| part.text.map(|t| t.value))
                    .collect();
                Message::bot(text)
            })
            .collect();

        let finish = match state.status {
            RunStatus::Incomplete => match state
                .detail
                .pointer("/incomplete_details/reason")
                .and_then(Value::as_str)
            {
                Some("content_filter") => FinishReason::ContentFilter,
                _ => FinishReason::OutputTokens,
            },
            _ => FinishReason::Stop,
        };

        Ok(Response {
            data,
            usage,
            finish,
            exchange: None,
        })
    }
}

// --- Assistants API Types ---

#[derive(Debug, Serialize)]
struct ThreadMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolOutput {
    tool_call_id: String,
    output: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: RunStatus,
}

#[derive(Debug, Deserialize)]
struct RunToolCall {
    id: String,
    function: RunFunctionCall,
}

#[derive(Debug, Deserialize)]
struct RunFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl TryFrom<RunToolCall> for ToolRequest {
    type Error = ClientError;

    fn try_from(call: RunToolCall) -> Result<Self, Self::Error> {
        let arguments = if call.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|source| {
                ClientError::MalformedToolArguments {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    source,
                }
            })?
        };
        Ok(ToolRequest {
            id: call.id,
            name: call.function.name,
            arguments,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessageObject>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessageObject {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}
