use futures::StreamExt;
use serde_json::{json, Value};
use tooltalk::agent::{Agent, ChatOptions};
use tooltalk::client::{Client, ClientError};
use tooltalk::model::{FinishReason, Message};
use tooltalk::options::{ModelOptions, TransportOptions};
use tooltalk::providers::{OpenAi, OpenAiClient, Provider};
use tooltalk::stream::StreamEvent;
use tooltalk::tools::ToolDefinition;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> OpenAiClient {
    OpenAi::create_at(
        format!("{}/v1", server.uri()),
        "sk-test".to_string(),
        ModelOptions::new("gpt-4o-mini").with_system("Be brief."),
        TransportOptions::default(),
    )
}

fn add_tool() -> ToolDefinition {
    ToolDefinition::from_sync_fn(
        "add",
        "Add two integers",
        json!({"type": "object", "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}}),
        |args| Ok((args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)).to_string()),
    )
}

#[tokio::test]
async fn test_request_maps_response_and_captures_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "add", "arguments": "{\"a\":2,\"b\":2}"}}
                ]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 31, "completion_tokens": 9, "total_tokens": 40}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let response = client
        .request(vec![Message::user("What is 2+2?")], vec![add_tool().spec()])
        .await
        .unwrap();

    assert_eq!(response.finish, FinishReason::ToolCalls);
    assert_eq!(response.usage.prompt_tokens, Some(31));
    assert_eq!(response.data[0].tool_requests()[0].arguments, json!({"a": 2, "b": 2}));

    let exchange = response.exchange.unwrap();
    assert_eq!(exchange.request["model"], "gpt-4o-mini");
    assert_eq!(exchange.request["messages"][0]["role"], "system");
    assert_eq!(exchange.request["tools"][0]["function"]["name"], "add");
    assert_eq!(exchange.response["id"], "chatcmpl-1");
}

#[tokio::test]
async fn test_error_status_becomes_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"type": "invalid_request_error", "message": "Incorrect API key provided"}
        })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .request(vec![Message::user("Hi")], vec![])
        .await
        .unwrap_err();

    match err {
        ClientError::ProviderError(message) => {
            assert!(message.contains("Incorrect API key provided"));
        }
        other => panic!("Expected ProviderError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_model_is_config_error() {
    let server = MockServer::start().await;
    let client = OpenAi::create_at(
        server.uri(),
        "sk-test".to_string(),
        ModelOptions::default(),
        TransportOptions::default(),
    );

    let err = client.request(vec![Message::user("Hi")], vec![]).await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

fn sse_body(fragments: &[Value]) -> String {
    let mut body: String = fragments
        .iter()
        .map(|f| format!("data: {}\n\n", f))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_streamed_chat_over_sse() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
        json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": "Hello"}}]}),
        json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": " there"}}]}),
        json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        json!({"object": "chat.completion.chunk", "choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
    ]);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let agent = Agent::new(client_for(&server));
    let options = ChatOptions::new();
    let events: Vec<StreamEvent> = agent.chat_stream("Hi", &options).collect().await;

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["", "Hello", " there"]);

    let Some(StreamEvent::Done(outcome)) = events.last() else {
        panic!("Expected Done as the last event");
    };
    assert!(outcome.is_complete());
    assert_eq!(outcome.last_message().unwrap().text(), "Hello there");
    assert_eq!(outcome.usage.completion_tokens, Some(2));

    let requests = server.received_requests().await.unwrap();
    let sent: Value = requests[0].body_json().unwrap();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["stream_options"]["include_usage"], true);
}
