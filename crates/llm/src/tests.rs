use super::*;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::{response::IntoResponse, routing::post, Router};
use bytes::Bytes;
use futures::stream;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

// Test scenario definition
#[derive(Clone)]
struct TestCase {
    name: String,
    request: LLMRequest,
    text_chunks: Vec<String>,
    tool_call: Option<(String, String, serde_json::Value)>,
    expected_response: LLMResponse,
}

impl TestCase {
    fn usage() -> Usage {
        Usage {
            input_tokens: 10,
            output_tokens: 20,
            ..Default::default()
        }
    }

    fn text_only() -> Self {
        let chunks = vec!["Hello".to_string(), ", world".to_string(), "!".to_string()];
        Self {
            name: "Simple text response".to_string(),
            request: LLMRequest {
                messages: vec![Message::user("Hello")],
                system_prompt: "You are a helpful assistant.".to_string(),
                request_id: 1,
                ..Default::default()
            },
            text_chunks: chunks,
            tool_call: None,
            expected_response: LLMResponse {
                content: vec![ContentBlock::Text {
                    text: "Hello, world!".to_string(),
                }],
                finish_reason: FinishReason::Stop,
                usage: Self::usage(),
                ..Default::default()
            },
        }
    }

    fn tool_call() -> Self {
        let input = json!({"id": 42, "verbose": true});
        Self {
            name: "Tool call response".to_string(),
            request: LLMRequest {
                messages: vec![Message::user("Look up record 42")],
                system_prompt: "You are a helpful assistant.".to_string(),
                tools: Some(vec![ToolDefinition {
                    name: "lookup".to_string(),
                    description: "Find a record by id".to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "verbose": {"type": "boolean"}
                        },
                        "required": ["id"]
                    }),
                }]),
                request_id: 1,
                ..Default::default()
            },
            text_chunks: vec!["Let me ".to_string(), "check.".to_string()],
            tool_call: Some(("tool-1-1".to_string(), "lookup".to_string(), input.clone())),
            expected_response: LLMResponse {
                content: vec![
                    ContentBlock::Text {
                        text: "Let me check.".to_string(),
                    },
                    ContentBlock::ToolUse {
                        id: "tool-1-1".to_string(),
                        name: "lookup".to_string(),
                        input,
                    },
                ],
                finish_reason: FinishReason::ToolCalls,
                usage: Self::usage(),
                ..Default::default()
            },
        }
    }

    fn all() -> Vec<Self> {
        vec![Self::text_only(), Self::tool_call()]
    }
}

/// Produces vendor payloads for a test case
trait MockResponseGenerator: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn generate_response(&self, case: &TestCase) -> serde_json::Value;
    /// SSE `data:` payloads of the streaming variant
    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value>;
    fn done_marker(&self) -> Option<&'static str> {
        None
    }
}

#[derive(Clone)]
struct OpenAIMockGenerator;

impl MockResponseGenerator for OpenAIMockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn generate_response(&self, case: &TestCase) -> serde_json::Value {
        let text: String = case.text_chunks.concat();
        let mut message = json!({"role": "assistant", "content": text});
        if let Some((id, name, input)) = &case.tool_call {
            message["tool_calls"] = json!([{
                "id": id, "type": "function",
                "function": {"name": name, "arguments": input.to_string()}
            }]);
        }
        json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": if case.tool_call.is_some() { "tool_calls" } else { "stop" }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        })
    }

    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value> {
        let mut events: Vec<_> = case
            .text_chunks
            .iter()
            .map(|chunk| json!({"choices": [{"index": 0, "delta": {"content": chunk}, "finish_reason": null}]}))
            .collect();
        if let Some((id, name, input)) = &case.tool_call {
            let args = input.to_string();
            let (head, tail) = args.split_at(args.len() / 2);
            events.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": id, "type": "function", "function": {"name": name, "arguments": head}}
            ]}}]}));
            events.push(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": tail}}
            ]}}]}));
        }
        events.push(json!({"choices": [{"index": 0, "delta": {},
            "finish_reason": if case.tool_call.is_some() { "tool_calls" } else { "stop" }}]}));
        events.push(json!({"choices": [],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}}));
        events
    }

    fn done_marker(&self) -> Option<&'static str> {
        Some("[DONE]")
    }
}

#[derive(Clone)]
struct MistralMockGenerator;

impl MockResponseGenerator for MistralMockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MistralAI
    }

    fn generate_response(&self, case: &TestCase) -> serde_json::Value {
        OpenAIMockGenerator.generate_response(case)
    }

    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value> {
        OpenAIMockGenerator.generate_events(case)
    }

    fn done_marker(&self) -> Option<&'static str> {
        Some("[DONE]")
    }
}

#[derive(Clone)]
struct AnthropicMockGenerator;

impl MockResponseGenerator for AnthropicMockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn generate_response(&self, case: &TestCase) -> serde_json::Value {
        let mut content = vec![json!({"type": "text", "text": case.text_chunks.concat()})];
        if let Some((id, name, input)) = &case.tool_call {
            content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
        json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude",
            "content": content,
            "stop_reason": if case.tool_call.is_some() { "tool_use" } else { "end_turn" },
            "usage": {"input_tokens": 10, "output_tokens": 20}
        })
    }

    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value> {
        let mut events = vec![
            json!({"type": "message_start", "message": {"id": "msg_1", "type": "message",
                "role": "assistant", "model": "claude", "usage": {"input_tokens": 10, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ];
        for chunk in &case.text_chunks {
            events.push(json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": chunk}}));
        }
        events.push(json!({"type": "content_block_stop", "index": 0}));
        if let Some((id, name, input)) = &case.tool_call {
            events.push(json!({"type": "content_block_start", "index": 1,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}));
            let args = input.to_string();
            let (head, tail) = args.split_at(args.len() / 2);
            for part in [head, tail] {
                events.push(json!({"type": "content_block_delta", "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": part}}));
            }
            events.push(json!({"type": "content_block_stop", "index": 1}));
        }
        events.push(json!({"type": "message_delta",
            "delta": {"stop_reason": if case.tool_call.is_some() { "tool_use" } else { "end_turn" }},
            "usage": {"output_tokens": 20}}));
        events.push(json!({"type": "message_stop"}));
        events
    }
}

#[derive(Clone)]
struct GeminiMockGenerator;

impl MockResponseGenerator for GeminiMockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn generate_response(&self, case: &TestCase) -> serde_json::Value {
        let mut parts = vec![json!({"text": case.text_chunks.concat()})];
        if let Some((_, name, input)) = &case.tool_call {
            parts.push(json!({"functionCall": {"name": name, "args": input}}));
        }
        json!({
            "candidates": [{"content": {"role": "model", "parts": parts}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 20, "totalTokenCount": 30}
        })
    }

    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value> {
        let mut events: Vec<_> = case
            .text_chunks
            .iter()
            .map(|chunk| json!({"candidates": [{"content": {"role": "model", "parts": [{"text": chunk}]}}]}))
            .collect();
        if let Some((_, name, input)) = &case.tool_call {
            events.push(json!({"candidates": [{"content": {"role": "model",
                "parts": [{"functionCall": {"name": name, "args": input}}]}}]}));
        }
        events.push(json!({
            "candidates": [{"content": {"role": "model", "parts": []}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 20, "totalTokenCount": 30}
        }));
        events
    }
}

#[derive(Clone)]
struct ResponsesMockGenerator;

impl MockResponseGenerator for ResponsesMockGenerator {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAIResponses
    }

    fn generate_response(&self, case: &TestCase) -> serde_json::Value {
        let mut output = vec![json!({"type": "message", "id": "msg_1", "role": "assistant",
            "content": [{"type": "output_text", "text": case.text_chunks.concat(), "annotations": []}]})];
        if let Some((id, name, input)) = &case.tool_call {
            output.push(json!({"type": "function_call", "id": "fc_1", "call_id": id,
                "name": name, "arguments": input.to_string()}));
        }
        json!({
            "id": "resp_1", "status": "completed", "output": output,
            "usage": {"input_tokens": 10, "output_tokens": 20, "total_tokens": 30}
        })
    }

    fn generate_events(&self, case: &TestCase) -> Vec<serde_json::Value> {
        let mut events = vec![json!({"type": "response.created", "response": {"id": "resp_1"}})];
        for chunk in &case.text_chunks {
            events.push(json!({"type": "response.output_text.delta", "item_id": "msg_1", "delta": chunk}));
        }
        if let Some((id, name, input)) = &case.tool_call {
            events.push(json!({"type": "response.output_item.added", "item": {
                "type": "function_call", "id": "fc_1", "call_id": id, "name": name, "arguments": ""}}));
            events.push(json!({"type": "response.function_call_arguments.delta",
                "item_id": "fc_1", "delta": input.to_string()}));
            events.push(json!({"type": "response.output_item.done", "item": {
                "type": "function_call", "id": "fc_1", "call_id": id, "name": name,
                "arguments": input.to_string()}}));
        }
        events.push(json!({"type": "response.completed", "response": {
            "id": "resp_1", "status": "completed", "output": [],
            "usage": {"input_tokens": 10, "output_tokens": 20, "total_tokens": 30}}}));
        events
    }
}

/// Render events as an SSE body cut into small chunks, so lines are split
/// across chunk boundaries the way real networks deliver them
fn chunked_sse_body(events: &[serde_json::Value], done_marker: Option<&str>) -> Vec<Bytes> {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    if let Some(marker) = done_marker {
        body.push_str(&format!("data: {marker}\n\n"));
    }
    body.as_bytes()
        .chunks(17)
        .map(Bytes::copy_from_slice)
        .collect()
}

// Helper to create a mock server for a provider
async fn create_mock_server(
    test_case: TestCase,
    generator: impl MockResponseGenerator + Clone + 'static,
) -> String {
    let app = Router::new().route(
        "/*path",
        post(
            move |Path(path): Path<String>, req: axum::extract::Json<serde_json::Value>| {
                let generator = generator.clone();
                let test_case = test_case.clone();
                async move {
                    let is_streaming = path.contains("stream")
                        || req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

                    if is_streaming {
                        let chunks = chunked_sse_body(
                            &generator.generate_events(&test_case),
                            generator.done_marker(),
                        );
                        let stream =
                            stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

                        axum::response::Response::builder()
                            .status(StatusCode::OK)
                            .header("content-type", "text/event-stream")
                            .body(axum::body::Body::from_stream(stream))
                            .unwrap()
                    } else {
                        (
                            StatusCode::OK,
                            axum::Json(generator.generate_response(&test_case)),
                        )
                            .into_response()
                    }
                }
            },
        ),
    );

    serve(app).await
}

async fn serve(app: Router) -> String {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", server_addr)
}

fn model_for(kind: ProviderKind, base_url: &str) -> ModelConfig {
    let mut model = ModelConfig::new(kind, "test-model");
    model.base_url = Some(base_url.to_string());
    model.api_key = Some("test-key".to_string());
    model
}

async fn stream_response(
    adapter: &Provider,
    transport: &dyn Transport,
    model: &ModelConfig,
    request: &LLMRequest,
) -> Result<(LLMResponse, Vec<String>), ApiError> {
    let wire = adapter.create_request(model, request, true)?;
    let mut stream = transport.open_stream(&wire).await?;
    let mut decoder = SseDecoder::new();
    let mut state = DecodeState::for_request(request);
    let mut fragments = Vec::new();

    while let Some(chunk) = stream.next_chunk().await? {
        for data in decoder.feed(&chunk) {
            fragments.extend(adapter.parse_stream_chunk(&mut state, &data));
        }
    }
    for data in decoder.finish() {
        fragments.extend(adapter.parse_stream_chunk(&mut state, &data));
    }

    let text_chunks = fragments
        .iter()
        .filter_map(|fragment| match fragment {
            StreamFragment::Text(text) => Some(text.clone()),
            _ => None,
        })
        .collect();
    Ok((LLMResponse::from_fragments(fragments), text_chunks))
}

async fn run_provider_tests(generator: impl MockResponseGenerator + Clone + 'static) {
    let registry = AdapterRegistry::new();
    let adapter = registry.get(generator.kind());
    let transport = HttpTransport::new(0);

    for case in TestCase::all() {
        let base_url = create_mock_server(case.clone(), generator.clone()).await;
        let model = model_for(generator.kind(), &base_url);

        // Test non-streaming
        let wire = adapter.create_request(&model, &case.request, false).unwrap();
        let body = transport.send(&wire).await.unwrap();
        let response = adapter
            .parse_response(&mut DecodeState::for_request(&case.request), &body)
            .unwrap();
        assert_eq!(
            response, case.expected_response,
            "Non-streaming mismatch for {:?}: {}",
            generator.kind(),
            case.name
        );

        // Test streaming
        let (response, text_chunks) = stream_response(&adapter, &transport, &model, &case.request)
            .await
            .unwrap();
        assert_eq!(
            response, case.expected_response,
            "Streaming mismatch for {:?}: {}",
            generator.kind(),
            case.name
        );
        assert_eq!(
            text_chunks, case.text_chunks,
            "Streaming text chunks mismatch for {:?}: {}",
            generator.kind(),
            case.name
        );
    }
}

#[tokio::test]
async fn test_openai_provider() {
    run_provider_tests(OpenAIMockGenerator).await;
}

#[tokio::test]
async fn test_mistral_provider() {
    run_provider_tests(MistralMockGenerator).await;
}

#[tokio::test]
async fn test_anthropic_provider() {
    run_provider_tests(AnthropicMockGenerator).await;
}

#[tokio::test]
async fn test_gemini_provider() {
    run_provider_tests(GeminiMockGenerator).await;
}

#[tokio::test]
async fn test_openai_responses_provider() {
    run_provider_tests(ResponsesMockGenerator).await;
}

// Helper to create a server that fails with `status` a number of times
async fn create_failing_server(
    failures: usize,
    status: StatusCode,
    seen_headers: Arc<Mutex<Vec<HeaderMap>>>,
) -> String {
    let attempts = Arc::new(Mutex::new(0usize));

    let app = Router::new().route(
        "/*path",
        post(move |headers: HeaderMap| {
            let attempts = attempts.clone();
            let seen_headers = seen_headers.clone();
            async move {
                seen_headers.lock().unwrap().push(headers);
                let mut current_attempts = attempts.lock().unwrap();
                *current_attempts += 1;
                if *current_attempts <= failures {
                    (
                        status,
                        [("retry-after", "0")],
                        axum::Json(json!({"error": {"message": "slow down"}})),
                    )
                        .into_response()
                } else {
                    (
                        StatusCode::OK,
                        axum::Json(OpenAIMockGenerator.generate_response(&TestCase::text_only())),
                    )
                        .into_response()
                }
            }
        }),
    );

    serve(app).await
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let seen_headers = Arc::new(Mutex::new(Vec::new()));
    let base_url =
        create_failing_server(2, StatusCode::TOO_MANY_REQUESTS, seen_headers.clone()).await;
    let model = model_for(ProviderKind::OpenAI, &base_url);
    let case = TestCase::text_only();

    let adapter = AdapterRegistry::new().get(ProviderKind::OpenAI);
    let wire = adapter.create_request(&model, &case.request, false).unwrap();
    let body = HttpTransport::new(3).send(&wire).await.unwrap();
    let response = adapter
        .parse_response(&mut DecodeState::default(), &body)
        .unwrap();

    assert_eq!(response.content, case.expected_response.content);
    let seen_headers = seen_headers.lock().unwrap();
    assert_eq!(seen_headers.len(), 3);
    assert_eq!(
        seen_headers[0].get("authorization").unwrap(),
        "Bearer test-key"
    );
}

#[tokio::test]
async fn test_retries_exhausted() {
    let seen_headers = Arc::new(Mutex::new(Vec::new()));
    let base_url =
        create_failing_server(5, StatusCode::TOO_MANY_REQUESTS, seen_headers.clone()).await;
    let model = model_for(ProviderKind::OpenAI, &base_url);

    let wire = AdapterRegistry::new()
        .get(ProviderKind::OpenAI)
        .create_request(&model, &TestCase::text_only().request, true)
        .unwrap();
    let error = match HttpTransport::new(1).open_stream(&wire).await {
        Err(error) => error,
        Ok(_) => panic!("expected the stream to fail"),
    };

    assert!(matches!(error, ApiError::RateLimit(msg) if msg.contains("slow down")));
    assert_eq!(seen_headers.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_authentication_error_is_not_retried() {
    let seen_headers = Arc::new(Mutex::new(Vec::new()));
    let base_url = create_failing_server(1, StatusCode::UNAUTHORIZED, seen_headers.clone()).await;
    let model = model_for(ProviderKind::Anthropic, &base_url);

    let wire = AdapterRegistry::new()
        .get(ProviderKind::Anthropic)
        .create_request(&model, &TestCase::text_only().request, false)
        .unwrap();
    let error = HttpTransport::new(3).send(&wire).await.unwrap_err();

    assert!(matches!(error, ApiError::Authentication(_)));
    let seen_headers = seen_headers.lock().unwrap();
    assert_eq!(seen_headers.len(), 1);
    assert_eq!(seen_headers[0].get("x-api-key").unwrap(), "test-key");
}
