use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tooltalk::agent::{AbortHandle, Agent, ChatOptions, Completion, Conversation};
use tooltalk::client::{Client, ClientError, StreamingClient, StreamingResponse};
use tooltalk::model::{BotMessage, Exchange, FinishReason, Message, Response, ToolRequest, Usage};
use tooltalk::stream::StreamEvent;
use tooltalk::tools::{ToolDefinition, ToolError, ToolSpec};

#[derive(Clone)]
struct MockClient {
    responses: Arc<Mutex<Vec<Result<Response, ClientError>>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockClient {
    fn new(responses: Vec<Result<Response, ClientError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Client for MockClient {
    async fn request(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolSpec>,
    ) -> Result<Response, ClientError> {
        self.requests.lock().unwrap().push(messages);
        let mut responses = self.responses.lock().unwrap();
        if !responses.is_empty() {
            responses.remove(0)
        } else {
            Err(ClientError::ProviderError(
                "No more mock responses".to_string(),
            ))
        }
    }
}

/// Replays scripted fragment lists, one per streamed round.
#[derive(Clone)]
struct MockStreamingClient {
    rounds: Arc<Mutex<Vec<Vec<Value>>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockStreamingClient {
    fn new(rounds: Vec<Vec<Value>>) -> Self {
        Self {
            rounds: Arc::new(Mutex::new(rounds)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Client for MockStreamingClient {
    async fn request(
        &self,
        _messages: Vec<Message>,
        _tools: Vec<ToolSpec>,
    ) -> Result<Response, ClientError> {
        Err(ClientError::ProviderError("streaming only".to_string()))
    }
}

#[async_trait]
impl StreamingClient for MockStreamingClient {
    async fn request_stream(
        &self,
        messages: Vec<Message>,
        _tools: Vec<ToolSpec>,
    ) -> Result<StreamingResponse, ClientError> {
        self.requests.lock().unwrap().push(messages);
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.is_empty() {
            return Err(ClientError::ProviderError("No more mock rounds".to_string()));
        }
        let fragments = rounds.remove(0);
        Ok(StreamingResponse {
            request: json!({"stream": true}),
            fragments: Box::pin(stream::iter(fragments.into_iter().map(Ok))),
        })
    }
}

fn text_response(text: &str) -> Result<Response, ClientError> {
    Ok(Response {
        data: vec![Message::bot(text)],
        usage: Usage {
            prompt_tokens: Some(10),
            completion_tokens: Some(2),
        },
        finish: FinishReason::Stop,
        exchange: None,
    })
}

fn tool_call_response(id: &str, name: &str, arguments: Value) -> Result<Response, ClientError> {
    Ok(Response {
        data: vec![Message::Bot(BotMessage {
            content: String::new(),
            tool_requests: vec![ToolRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }],
            tool_responses: vec![],
        })],
        usage: Usage::default(),
        finish: FinishReason::ToolCalls,
        exchange: Some(Exchange {
            request: json!({"round": id}),
            response: json!({}),
        }),
    })
}

fn add_tool() -> ToolDefinition {
    ToolDefinition::from_sync_fn(
        "add",
        "Add two integers",
        json!({"type": "object"}),
        |args| {
            let a = args["a"].as_i64().ok_or_else(|| ToolError::msg("a is required"))?;
            let b = args["b"].as_i64().ok_or_else(|| ToolError::msg("b is required"))?;
            Ok((a + b).to_string())
        },
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn chunk(choice: Value) -> Value {
    json!({"object": "chat.completion.chunk", "choices": [choice]})
}

#[tokio::test]
async fn test_agent_simple_chat() {
    let client = MockClient::new(vec![text_response("Hello")]);
    let agent = Agent::new(client.clone());

    let outcome = agent.chat("Hi", &ChatOptions::new()).await;

    assert_eq!(outcome.completion, Completion::Complete);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.history, vec![Message::user("Hi"), Message::bot("Hello")]);
    assert_eq!(outcome.usage.prompt_tokens, Some(10));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn test_tool_round_trip() {
    init_tracing();
    let client = MockClient::new(vec![
        tool_call_response("call_1", "add", json!({"a": 2, "b": 2})),
        text_response("2+2 is 4"),
    ]);
    let agent = Agent::new(client.clone()).with_span(tracing::info_span!("session", id = 7));
    let options = ChatOptions::new().with_tool(add_tool());

    let outcome = agent.chat("What is 2+2?", &options).await;

    assert!(outcome.is_complete());
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.history.len(), 4);
    assert_eq!(outcome.history[2].tool_responses()[0].id, "call_1");
    assert_eq!(outcome.history[2].tool_responses()[0].data, "4");
    assert_eq!(outcome.last_message().unwrap().text(), "2+2 is 4");
    assert!(outcome.unresolved().is_empty());

    // The second round sees the request and its response.
    let requests = client.requests();
    assert_eq!(requests[1].len(), 3);
    assert_eq!(requests[1][2].tool_responses()[0].data, "4");
}

#[tokio::test]
async fn test_unknown_tool_becomes_response() {
    let client = MockClient::new(vec![
        tool_call_response("call_1", "multiply", json!({})),
        text_response("I can't multiply."),
    ]);
    let agent = Agent::new(client);
    let options = ChatOptions::new().with_tool(add_tool());

    let outcome = agent.chat("3*3?", &options).await;

    let response = &outcome.history[2].tool_responses()[0];
    let data: Value = serde_json::from_str(&response.data).unwrap();
    assert_eq!(data, json!({"error": "Unknown tool: multiply"}));
    assert!(outcome.is_complete());
}

#[tokio::test]
async fn test_handler_error_becomes_response() {
    let client = MockClient::new(vec![
        tool_call_response("call_1", "add", json!({"a": 2})),
        text_response("Missing an operand."),
    ]);
    let agent = Agent::new(client);
    let options = ChatOptions::new().with_tool(add_tool());

    let outcome = agent.chat("2+?", &options).await;

    let data: Value =
        serde_json::from_str(&outcome.history[2].tool_responses()[0].data).unwrap();
    assert_eq!(data["error"], "Tool error: b is required");
    assert_eq!(outcome.rounds, 2);
}

#[tokio::test]
async fn test_handler_panic_becomes_response() {
    let boom = ToolDefinition::from_sync_fn("boom", "Always panics", json!({}), |_| {
        panic!("kaboom")
    });
    let client = MockClient::new(vec![
        tool_call_response("call_1", "boom", json!({})),
        text_response("That tool is broken."),
    ]);
    let agent = Agent::new(client);

    let outcome = agent.chat("go", &ChatOptions::new().with_tool(boom)).await;

    let data: Value =
        serde_json::from_str(&outcome.history[2].tool_responses()[0].data).unwrap();
    assert_eq!(data["error"], "Tool panicked: kaboom");
    assert!(outcome.is_complete());
}

#[tokio::test]
async fn test_transport_error_appends_error_message() {
    let client = MockClient::new(vec![Err(ClientError::ProviderError(
        "rate limited".to_string(),
    ))]);
    let agent = Agent::new(client);

    let outcome = agent.chat("Hi", &ChatOptions::new()).await;

    assert_eq!(outcome.history.len(), 2);
    assert!(outcome.history[1].is_error());
    assert_eq!(outcome.history[1].text(), "Provider error: rate limited");
    assert!(matches!(outcome.completion, Completion::Failed(_)));
}

#[tokio::test]
async fn test_max_iterations_bounds_requests() {
    let client = MockClient::new(vec![
        tool_call_response("call_1", "add", json!({"a": 1, "b": 1})),
        tool_call_response("call_2", "add", json!({"a": 2, "b": 2})),
        tool_call_response("call_3", "add", json!({"a": 3, "b": 3})),
        tool_call_response("call_4", "add", json!({"a": 4, "b": 4})),
    ]);
    let agent = Agent::new(client.clone());
    let options = ChatOptions::new()
        .with_tool(add_tool())
        .with_max_iterations(2);

    let outcome = agent.chat("loop", &options).await;

    assert_eq!(client.requests().len(), 2);
    assert_eq!(outcome.rounds, 2);
    match &outcome.completion {
        Completion::Incomplete { awaiting_reply } => {
            assert_eq!(awaiting_reply.len(), 1);
            assert_eq!(awaiting_reply[0].id, "call_2");
            assert_eq!(awaiting_reply[0].data, "4");
        }
        other => panic!("Expected Incomplete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_default_max_iterations_is_three() {
    let client = MockClient::new(
        (1..=5)
            .map(|i| tool_call_response(&format!("call_{}", i), "add", json!({"a": i, "b": 0})))
            .collect(),
    );
    let agent = Agent::new(client.clone());

    let outcome = agent
        .chat("loop", &ChatOptions::new().with_tool(add_tool()))
        .await;

    assert_eq!(client.requests().len(), 3);
    assert!(!outcome.is_complete());
}

#[tokio::test]
async fn test_resolved_requests_are_not_rerun() {
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let counted = ToolDefinition::from_sync_fn("add", "Counts calls", json!({}), move |_| {
        *counter.lock().unwrap() += 1;
        Ok("ok".to_string())
    });

    // History already holds an answered request from an earlier session.
    let history = vec![
        Message::user("first"),
        Message::Bot(BotMessage {
            content: String::new(),
            tool_requests: vec![ToolRequest {
                id: "call_old".to_string(),
                name: "add".to_string(),
                arguments: json!({}),
            }],
            tool_responses: vec![],
        }),
        Message::Bot(BotMessage::responding(tooltalk::model::ToolResponse {
            id: "call_old".to_string(),
            name: "add".to_string(),
            data: "ok".to_string(),
        })),
        Message::user("second"),
    ];

    let client = MockClient::new(vec![
        tool_call_response("call_new", "add", json!({})),
        text_response("done"),
    ]);
    let agent = Agent::new(client);

    let outcome = agent
        .chat(history, &ChatOptions::new().with_tool(counted))
        .await;

    assert_eq!(*calls.lock().unwrap(), 1);
    assert!(outcome.is_complete());
    assert_eq!(outcome.history.len(), 7);
}

#[tokio::test]
async fn test_auto_reply_off_stops_after_tools() {
    let client = MockClient::new(vec![
        tool_call_response("call_1", "add", json!({"a": 2, "b": 2})),
        text_response("never sent"),
    ]);
    let agent = Agent::new(client.clone());
    let options = ChatOptions::new()
        .with_tool(add_tool())
        .with_auto_reply(false);

    let outcome = agent.chat("2+2", &options).await;

    assert_eq!(client.requests().len(), 1);
    assert_eq!(outcome.history.len(), 3);
    assert!(matches!(outcome.completion, Completion::Incomplete { .. }));
}

#[tokio::test]
async fn test_abort_before_first_round() {
    let client = MockClient::new(vec![text_response("unused")]);
    let agent = Agent::new(client.clone());
    let abort = AbortHandle::new();
    abort.abort();

    let outcome = agent
        .chat("Hi", &ChatOptions::new().with_abort(abort))
        .await;

    assert_eq!(outcome.completion, Completion::Aborted);
    assert_eq!(outcome.rounds, 0);
    assert!(client.requests().is_empty());
    assert_eq!(outcome.history, vec![Message::user("Hi")]);
}

#[tokio::test]
async fn test_capture_exchanges() {
    let client = MockClient::new(vec![
        tool_call_response("call_1", "add", json!({"a": 1, "b": 2})),
        text_response("3"),
    ]);
    let agent = Agent::new(client);
    let options = ChatOptions::new()
        .with_tool(add_tool())
        .with_capture_exchanges(true);

    let outcome = agent.chat("1+2", &options).await;

    // Only the first response carried an exchange.
    assert_eq!(outcome.exchanges.len(), 1);
    assert_eq!(outcome.exchanges[0].request, json!({"round": "call_1"}));
}

#[tokio::test]
async fn test_conversation_records_history() {
    let client = MockClient::new(vec![text_response("Hello"), text_response("Still here")]);
    let mut conversation = Conversation::new(Agent::new(client.clone()), ChatOptions::new());

    conversation.send(Message::user("Hi")).await;
    assert_eq!(conversation.history().len(), 2);

    conversation.send(Message::user("You there?")).await;
    assert_eq!(conversation.history().len(), 4);
    assert_eq!(client.requests()[1].len(), 3);
}

#[tokio::test]
async fn test_conversation_without_recording() {
    let client = MockClient::new(vec![text_response("Hello")]);
    let mut conversation = Conversation::new(
        Agent::new(client),
        ChatOptions::new().with_record(false),
    )
    .with_history(vec![Message::system("Be kind.")]);

    let outcome = conversation.send(Message::user("Hi")).await;

    assert_eq!(outcome.history.len(), 3);
    assert_eq!(conversation.history(), &[Message::system("Be kind.")]);
}

#[tokio::test]
async fn test_chat_stream_tool_round_trip() {
    init_tracing();
    let client = MockStreamingClient::new(vec![
        vec![
            chunk(json!({"index": 0, "delta": {"role": "assistant", "tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "add", "arguments": "{\"a\": 2,"}}
            ]}})),
            chunk(json!({"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": " \"b\": 2}"}}
            ]}})),
            chunk(json!({"index": 0, "delta": {}, "finish_reason": "tool_calls"})),
        ],
        vec![
            chunk(json!({"index": 0, "delta": {"role": "assistant", "content": "It is "}})),
            chunk(json!({"index": 0, "delta": {"content": "4."}})),
            chunk(json!({"index": 0, "delta": {}, "finish_reason": "stop"})),
            json!({"object": "chat.completion.chunk", "choices": [],
                   "usage": {"prompt_tokens": 20, "completion_tokens": 4}}),
        ],
    ]);
    let agent = Agent::new(client);
    let options = ChatOptions::new().with_tool(add_tool());

    let events: Vec<StreamEvent> = agent.chat_stream("What is 2+2?", &options).collect().await;

    assert!(events.contains(&StreamEvent::ToolRequest {
        choice: 0,
        request: ToolRequest {
            id: "call_1".to_string(),
            name: "add".to_string(),
            arguments: json!({"a": 2, "b": 2}),
        },
    }));
    assert!(events.contains(&StreamEvent::Text {
        choice: 0,
        text: "It is 4.".to_string(),
    }));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolResponse(r) if r.data == "4")));

    let Some(StreamEvent::Done(outcome)) = events.last() else {
        panic!("Expected Done as the last event");
    };
    assert!(outcome.is_complete());
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.usage.prompt_tokens, Some(20));
    assert_eq!(outcome.last_message().unwrap().text(), "It is 4.");
}

#[tokio::test]
async fn test_chat_stream_malformed_arguments() {
    let client = MockStreamingClient::new(vec![vec![
        chunk(json!({"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "add", "arguments": "{\"a\": "}}
        ]}})),
        chunk(json!({"index": 0, "delta": {}, "finish_reason": "tool_calls"})),
    ]]);
    let agent = Agent::new(client.clone());
    let options = ChatOptions::new().with_tool(add_tool());

    let events: Vec<StreamEvent> = agent.chat_stream("2+?", &options).collect().await;

    assert!(events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    let Some(StreamEvent::Done(outcome)) = events.last() else {
        panic!("Expected Done as the last event");
    };
    assert!(matches!(outcome.completion, Completion::Failed(_)));
    assert!(outcome.last_message().unwrap().is_error());
    assert_eq!(client.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_chat_stream_without_finish_marker_fails() {
    let client = MockStreamingClient::new(vec![vec![
        chunk(json!({"index": 0, "delta": {"role": "assistant", "content": "Let me add"}})),
        chunk(json!({"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "add", "arguments": "{\"a\": 2, \"b\": 2}"}}
        ]}})),
    ]]);
    let agent = Agent::new(client);
    let options = ChatOptions::new().with_tool(add_tool());

    let events: Vec<StreamEvent> = agent.chat_stream("2+2?", &options).collect().await;

    assert!(events.iter().any(|e| matches!(e, StreamEvent::TextDelta { .. })));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Error(_))));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolResponse(_))));

    let Some(StreamEvent::Done(outcome)) = events.last() else {
        panic!("Expected Done as the last event");
    };
    match &outcome.completion {
        Completion::Failed(reason) => assert!(reason.starts_with("Incomplete")),
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert_eq!(outcome.history.len(), 2);
    assert!(outcome.history[1].is_error());
}
