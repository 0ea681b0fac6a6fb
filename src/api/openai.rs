//! OpenAI Chat Completions API client implementation.
//!
//! Works for any provider exposing the same `/chat/completions` endpoint. Streamed
//! chunks are passed through undecoded for the [`DeltaDetector`](crate::delta::DeltaDetector).

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{Client, ClientError, StreamingClient, StreamingResponse};
use crate::http::{
    add_extra_headers, build_http_client, to_value_lossy, RequestBuilderExt, ResponseExt,
};
use crate::model::{BotMessage, Exchange, FinishReason, Message, Response, ToolRequest, Usage};
use crate::options::{ModelOptions, TransportOptions};
use crate::sse::SSEResponseExt;
use crate::tools::ToolSpec;

/// Trait for models compatible with OpenAI's Chat Completions API.
pub trait OpenAiCompatibleModel:
    Send + Sync + Default + Serialize + for<'de> Deserialize<'de> + Clone
{
}

/// Generic client for OpenAI-compatible Chat Completions APIs.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient<M> {
    api_key: String,
    base_url: String,
    model_options: ModelOptions<M>,
    transport_options: TransportOptions,
}

impl<M: OpenAiCompatibleModel> OpenAiCompatibleClient<M> {
    /// Create a new client. `base_url` includes the version segment, e.g.
    /// `https://api.openai.com/v1`.
    pub fn new(
        api_key: String,
        base_url: String,
        model_options: ModelOptions<M>,
        transport_options: TransportOptions,
    ) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_options,
            transport_options,
        }
    }

    pub fn model_options(&self) -> &ModelOptions<M> {
        &self.model_options
    }

    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<ChatRequest<M>, ClientError> {
        if self.model_options.model.is_empty() {
            return Err(ClientError::Config("Model must be specified".to_string()));
        }
        Ok(ChatRequest::new(messages, &self.model_options, tools))
    }

    async fn send(&self, body: &ChatRequest<M>) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let http_client = build_http_client(&self.transport_options)?;

        let req = http_client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json");

        let response = add_extra_headers(req, &self.transport_options)
            .json_logged(body)
            .send()
            .await?;
        response.error_for_status_logged().await
    }
}

#[async_trait]
impl<M: OpenAiCompatibleModel> Client for OpenAiCompatibleClient<M> {
    async fn request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<Response, ClientError> {
        let request_body = self.build_request(messages, tools)?;
        let raw: Value = self.send(&request_body).await?.json_logged().await?;

        let chat_response: ChatResponse = serde_json::from_value(raw.clone())?;
        let mut response = Response::try_from(chat_response)?;
        response.exchange = Some(Exchange {
            request: to_value_lossy(&request_body),
            response: raw,
        });
        Ok(response)
    }
}

#[async_trait]
impl<M: OpenAiCompatibleModel + 'static> StreamingClient for OpenAiCompatibleClient<M> {
    async fn request_stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
    ) -> Result<StreamingResponse, ClientError> {
        let mut request_body = self.build_request(messages, tools)?;
        request_body.stream = Some(true);
        request_body.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        let response = self.send(&request_body).await?;
        Ok(StreamingResponse {
            request: to_value_lossy(&request_body),
            fragments: Box::pin(response.sse_json()),
        })
    }
}

impl<M: OpenAiCompatibleModel> ChatRequest<M> {
    fn new(history: Vec<Message>, model_options: &ModelOptions<M>, tool_specs: Vec<ToolSpec>) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = &model_options.system {
            messages.push(ChatMessage::text("system", system.clone()));
        }
        for message in history {
            push_chat_messages(&mut messages, message);
        }

        let tools = if tool_specs.is_empty() {
            None
        } else {
            Some(
                tool_specs
                    .into_iter()
                    .map(|spec| ChatTool {
                        tool_type: "function".to_string(),
                        function: ChatFunction {
                            name: spec.name,
                            description: Some(spec.description).filter(|d| !d.is_empty()),
                            parameters: spec.input_schema,
                        },
                    })
                    .collect(),
            )
        };

        ChatRequest {
            model: model_options.model.clone(),
            messages,
            temperature: model_options.temperature,
            top_p: model_options.top_p,
            max_tokens: model_options.max_tokens,
            stream: None,
            stream_options: None,
            tools,
            provider_options: model_options.provider.clone(),
        }
    }
}

/// Append the wire messages for one history entry. Error entries are local records
/// and are not sent.
fn push_chat_messages(out: &mut Vec<ChatMessage>, message: Message) {
    match message {
        Message::User(content) => out.push(ChatMessage::text("user", content)),
        Message::System(content) => out.push(ChatMessage::text("system", content)),
        Message::Error(_) => {}
        Message::Bot(bot) => {
            if !bot.content.is_empty() || !bot.tool_requests.is_empty() {
                let tool_calls: Vec<ChatToolCall> = bot
                    .tool_requests
                    .iter()
                    .map(|request| ChatToolCall {
                        id: request.id.clone(),
                        tool_type: "function".to_string(),
                        function: ChatFunctionCall {
                            name: request.name.clone(),
                            arguments: request.arguments.to_string(),
                        },
                    })
                    .collect();

                out.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(bot.content).filter(|c| !c.is_empty()),
                    tool_calls: Some(tool_calls).filter(|calls| !calls.is_empty()),
                    tool_call_id: None,
                });
            }

            for response in bot.tool_responses {
                out.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(response.data),
                    tool_calls: None,
                    tool_call_id: Some(response.id),
                });
            }
        }
    }
}

impl TryFrom<ChatMessage> for Message {
    type Error = ClientError;

    fn try_from(msg: ChatMessage) -> Result<Self, ClientError> {
        let tool_requests = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
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
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        Ok(Message::Bot(BotMessage {
            content: msg.content.unwrap_or_default(),
            tool_requests,
            tool_responses: Vec::new(),
        }))
    }
}

impl TryFrom<ChatResponse> for Response {
    type Error = ClientError;

    fn try_from(chat_resp: ChatResponse) -> Result<Self, Self::Error> {
        let finish = chat_resp
            .choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .map(FinishReason::from_wire)
            .unwrap_or_default();

        let data = chat_resp
            .choices
            .into_iter()
            .map(|choice| Message::try_from(choice.message))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Response {
            data,
            usage: chat_resp.usage.unwrap_or_default(),
            finish,
            exchange: None,
        })
    }
}

// --- Chat Completions API Types ---

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
struct ChatRequest<M> {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    stream: Option<bool>,
    stream_options: Option<StreamOptions>,
    tools: Option<Vec<ChatTool>>,
    #[serde(flatten)]
    provider_options: M,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatFunction,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
struct ChatFunction {
    name: String,
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}
