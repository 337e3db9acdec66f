//! OpenAI chat completions adapter.
//!
//! Tools use the externally-tagged descriptor shape
//! `{"type": "function", "function": {...}}`. Other OpenAI-compatible
//! vendors reuse this adapter through a `RequestCustomizer`.

use crate::adapter::{self, DecodeState, ProviderAdapter, WireRequest};
use crate::factory::ProviderKind;
use crate::provider_config::ModelConfig;
use crate::{
    ApiError, Citation, ContentBlock, FinishReason, LLMRequest, LLMResponse, Message,
    MessageRole, SafetyWarning, StreamFragment, Usage,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, trace};

/// Hook for OpenAI-compatible vendors that deviate from the reference API
pub trait RequestCustomizer: Send + Sync {
    fn customize_request(&self, request: &mut serde_json::Value);

    /// Name of the output token budget parameter
    fn max_tokens_field(&self) -> &'static str {
        "max_completion_tokens"
    }

    fn additional_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Customizer for the reference OpenAI API, leaves requests untouched
pub struct DefaultRequestCustomizer;

impl RequestCustomizer for DefaultRequestCustomizer {
    fn customize_request(&self, _request: &mut serde_json::Value) {}
}

#[derive(Clone)]
pub struct OpenAIAdapter {
    kind: ProviderKind,
    customizer: Arc<dyn RequestCustomizer>,
}

impl std::fmt::Debug for OpenAIAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIAdapter")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Default for OpenAIAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Model families that reject a `temperature` parameter
const FIXED_TEMPERATURE_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

/// Whether `temperature` may be sent for this model
pub(crate) fn accepts_temperature(model: &ModelConfig) -> bool {
    model.supports_temperature.unwrap_or_else(|| {
        let name = model.model.rsplit('/').next().unwrap_or(&model.model);
        !FIXED_TEMPERATURE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    })
}

pub(crate) fn data_url(media_type: &str, data: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(default)]
    annotations: Vec<OpenAIAnnotation>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    id: String,
    function: OpenAIFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCallDelta>,
    #[serde(default)]
    annotations: Vec<OpenAIAnnotation>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIAnnotation {
    #[serde(rename = "type")]
    annotation_type: String,
    #[serde(default)]
    url_citation: Option<OpenAIUrlCitation>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUrlCitation {
    #[serde(default)]
    start_index: Option<usize>,
    #[serde(default)]
    end_index: Option<usize>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAIPromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct OpenAIPromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl From<OpenAIUsage> for Usage {
    fn from(usage: OpenAIUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .map(|details| details.cached_tokens)
                .unwrap_or(0),
        }
    }
}

impl OpenAIAnnotation {
    fn into_citation(self) -> Option<Citation> {
        if self.annotation_type != "url_citation" {
            return None;
        }
        let citation = self.url_citation?;
        Some(Citation {
            start: citation.start_index,
            end: citation.end_index,
            text: None,
            url: citation.url,
            title: citation.title,
        })
    }
}

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self::with_customizer(ProviderKind::OpenAI, Arc::new(DefaultRequestCustomizer))
    }

    pub fn with_customizer(kind: ProviderKind, customizer: Arc<dyn RequestCustomizer>) -> Self {
        Self { kind, customizer }
    }

    pub(crate) fn convert_message(message: &Message) -> Vec<serde_json::Value> {
        match message.role {
            MessageRole::User => Self::convert_user_message(&message.content),
            MessageRole::Assistant => Self::convert_assistant_message(&message.content),
            MessageRole::Tool => Self::convert_tool_results(&message.content),
        }
    }

    fn convert_user_message(blocks: &[ContentBlock]) -> Vec<serde_json::Value> {
        // Tool results can arrive on user messages from older histories
        let mut messages = Self::convert_tool_results(blocks);

        let has_image = blocks
            .iter()
            .any(|block| matches!(block, ContentBlock::Image { .. }));
        let content = if has_image {
            let parts: Vec<serde_json::Value> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentBlock::Image { media_type, data } => Some(json!({
                        "type": "image_url",
                        "image_url": {"url": data_url(media_type, data)}
                    })),
                    _ => None,
                })
                .collect();
            json!(parts)
        } else {
            let text = Message {
                role: MessageRole::User,
                content: blocks.to_vec(),
            }
            .text();
            if text.is_empty() {
                return messages;
            }
            json!(text)
        };

        messages.push(json!({"role": "user", "content": content}));
        messages
    }

    fn convert_assistant_message(blocks: &[ContentBlock]) -> Vec<serde_json::Value> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()}
                })),
                // Thinking and generated images are not resubmitted
                _ => {}
            }
        }

        let mut message = json!({"role": "assistant"});
        message["content"] = if text.is_empty() {
            serde_json::Value::Null
        } else {
            json!(text)
        };
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }
        vec![message]
    }

    fn convert_tool_results(blocks: &[ContentBlock]) -> Vec<serde_json::Value> {
        blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content
                })),
                _ => None,
            })
            .collect()
    }

    fn map_finish_reason(reason: &str) -> FinishReason {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    fn content_filter_warning() -> SafetyWarning {
        SafetyWarning {
            category: "content_filter".to_string(),
            detail: "Output was omitted by the provider's content filter".to_string(),
        }
    }

    fn refusal_warning(refusal: &str) -> SafetyWarning {
        SafetyWarning {
            category: "refusal".to_string(),
            detail: refusal.to_string(),
        }
    }
}

impl ProviderAdapter for OpenAIAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        let mut messages = Vec::new();
        if !request.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": request.system_prompt}));
        }
        for message in &request.messages {
            messages.extend(Self::convert_message(message));
        }

        let mut body = json!({
            "model": model.model,
            "messages": messages,
        });

        if streaming {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        if let Some(max_tokens) = adapter::max_output_tokens(model, request) {
            body[self.customizer.max_tokens_field()] = json!(max_tokens);
        }

        if let Some(temperature) = adapter::temperature(model, request) {
            if accepts_temperature(model) {
                body["temperature"] = json!(temperature);
            } else {
                debug!("Omitting temperature for model {}", model.model);
            }
        }

        if let Some(stop) = &request.options.stop_sequences {
            body["stop"] = json!(stop);
        }

        let tools = request.tool_definitions();
        if !tools.is_empty() {
            body["tools"] = json!(tools
                .iter()
                .map(|tool| json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                }))
                .collect::<Vec<_>>());
            body["tool_choice"] = json!("auto");
        }

        if let Some(schema) = &request.options.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true
                }
            });
        }

        if request.options.grounding {
            debug!("Grounding is not available on chat completions, ignoring");
        }

        self.customizer.customize_request(&mut body);

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(api_key) = &model.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }
        headers.extend(self.customizer.additional_headers());

        Ok(WireRequest {
            url: format!("{}/chat/completions", model.base_url()),
            headers,
            body,
            streaming,
        })
    }

    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment> {
        if data == "[DONE]" {
            return Vec::new();
        }

        let chunk: OpenAIStreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => return vec![adapter::parse_error(data, e)],
        };
        trace!("Received stream event: '{}'", data);

        let mut fragments = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;

            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if !reasoning.is_empty() {
                    fragments.push(StreamFragment::Thinking(reasoning));
                }
            }

            if let Some(content) = delta.content {
                if !content.is_empty() {
                    fragments.push(StreamFragment::Text(content));
                }
            }

            if let Some(refusal) = delta.refusal {
                if state.first_warning("refusal") {
                    fragments.push(StreamFragment::SafetyWarning(Self::refusal_warning(
                        &refusal,
                    )));
                }
            }

            for tool_call in delta.tool_calls {
                let key = tool_call.index.to_string();
                let (name, arguments) = match tool_call.function {
                    Some(function) => (function.name, function.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };

                if let Some(id) = tool_call.id {
                    state.register_call(key.clone(), id, name.clone().unwrap_or_default());
                }

                match state.call(&key) {
                    Some(call) => fragments.push(StreamFragment::ToolCallDelta {
                        id: call.id.clone(),
                        name,
                        arguments,
                    }),
                    None => fragments.push(StreamFragment::ParseError {
                        message: format!("Tool call delta for unknown index {key}"),
                        tool_call_id: None,
                    }),
                }
            }

            fragments.extend(
                delta
                    .annotations
                    .into_iter()
                    .filter_map(OpenAIAnnotation::into_citation)
                    .map(StreamFragment::Grounding),
            );

            if let Some(reason) = choice.finish_reason {
                for id in state.complete_all_calls() {
                    fragments.push(StreamFragment::ToolCallComplete { id });
                }
                let reason = Self::map_finish_reason(&reason);
                if reason == FinishReason::ContentFilter && state.first_warning("content_filter")
                {
                    fragments.push(StreamFragment::SafetyWarning(
                        Self::content_filter_warning(),
                    ));
                }
                fragments.push(StreamFragment::Finish(reason));
            }
        }

        if let Some(usage) = chunk.usage {
            fragments.push(StreamFragment::Usage(usage.into()));
        }

        fragments
    }

    fn parse_response(
        &self,
        _state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        let response: OpenAIResponse =
            serde_json::from_str(body).map_err(|e| adapter::decode_error(body, e))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Decode("Response contains no choices".to_string()))?;

        let mut result = LLMResponse::default();
        let message = choice.message;

        if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
            result.content.push(ContentBlock::Thinking {
                thinking: reasoning,
                signature: String::new(),
            });
        }
        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            result.content.push(ContentBlock::Text { text });
        }
        for call in message.tool_calls {
            let input = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::String(call.function.arguments))
            };
            result.content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        result.citations = message
            .annotations
            .into_iter()
            .filter_map(OpenAIAnnotation::into_citation)
            .collect();
        if let Some(refusal) = message.refusal {
            result.safety_warnings.push(Self::refusal_warning(&refusal));
        }

        result.finish_reason = choice
            .finish_reason
            .as_deref()
            .map(Self::map_finish_reason)
            .unwrap_or_default();
        if result.finish_reason == FinishReason::ContentFilter {
            result.safety_warnings.push(Self::content_filter_warning());
        }
        result.usage = response.usage.map(Usage::from).unwrap_or_default();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatOptions, ResponseSchema, ToolDefinition};

    fn model(name: &str) -> ModelConfig {
        let mut config = ModelConfig::new(ProviderKind::OpenAI, name);
        config.api_key = Some("sk-test".to_string());
        config
    }

    fn decode(adapter: &OpenAIAdapter, lines: &[&str]) -> Vec<StreamFragment> {
        let mut state = DecodeState::default();
        lines
            .iter()
            .flat_map(|line| adapter.parse_stream_chunk(&mut state, line))
            .collect()
    }

    #[test]
    fn test_request_uses_externally_tagged_tools() {
        let request = LLMRequest {
            system_prompt: "Be brief".into(),
            messages: vec![Message::user("Look up 42")],
            tools: Some(vec![ToolDefinition {
                name: "lookup".into(),
                description: "Find a record".into(),
                parameters: json!({"type": "object", "properties": {"id": {"type": "integer"}}}),
            }]),
            options: ChatOptions {
                max_output_tokens: Some(512),
                temperature: Some(0.2),
                ..Default::default()
            },
            ..Default::default()
        };

        let wire = OpenAIAdapter::new()
            .create_request(&model("gpt-4.1"), &request, true)
            .unwrap();

        assert_eq!(wire.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(wire.header("authorization"), Some("Bearer sk-test"));
        assert_eq!(wire.body["messages"][0]["role"], "system");
        assert_eq!(wire.body["messages"][1]["content"], "Look up 42");
        assert_eq!(wire.body["tools"][0]["type"], "function");
        assert_eq!(wire.body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(wire.body["max_completion_tokens"], 512);
        assert_eq!(wire.body["stream_options"]["include_usage"], true);
        assert!((wire.body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_temperature_omitted_for_reasoning_models() {
        let request = LLMRequest {
            messages: vec![Message::user("hi")],
            options: ChatOptions {
                temperature: Some(0.7),
                ..Default::default()
            },
            ..Default::default()
        };
        let adapter = OpenAIAdapter::new();

        let wire = adapter
            .create_request(&model("o3-mini"), &request, false)
            .unwrap();
        assert!(wire.body.get("temperature").is_none());
        assert!(wire.body.get("stream").is_none());

        let mut overridden = model("o3-mini");
        overridden.supports_temperature = Some(true);
        let wire = adapter.create_request(&overridden, &request, false).unwrap();
        assert!(wire.body.get("temperature").is_some());
    }

    #[test]
    fn test_structured_output_uses_json_schema_mode() {
        let request = LLMRequest {
            messages: vec![Message::user("hi")],
            options: ChatOptions {
                response_schema: Some(ResponseSchema {
                    name: "answer".into(),
                    schema: json!({"type": "object"}),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let wire = OpenAIAdapter::new()
            .create_request(&model("gpt-4.1"), &request, false)
            .unwrap();
        assert_eq!(wire.body["response_format"]["type"], "json_schema");
        assert_eq!(wire.body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn test_tool_history_conversion() {
        let messages = [
            Message::assistant(vec![
                ContentBlock::Text {
                    text: "Checking".into(),
                },
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    input: json!({"id": 42}),
                },
            ]),
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                tool_name: "lookup".into(),
                content: "found".into(),
                is_error: false,
            }]),
        ];
        let converted: Vec<_> = messages
            .iter()
            .flat_map(OpenAIAdapter::convert_message)
            .collect();

        assert_eq!(converted[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            converted[0]["tool_calls"][0]["function"]["arguments"],
            "{\"id\":42}"
        );
        assert_eq!(converted[1]["role"], "tool");
        assert_eq!(converted[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_streaming_tool_call_reassembly() {
        let fragments = decode(
            &OpenAIAdapter::new(),
            &[
                r#"{"choices":[{"delta":{"role":"assistant","content":"Let me check"},"finish_reason":null}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":""}}]},"finish_reason":null}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"id\":"}}]},"finish_reason":null}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"42}"}}]},"finish_reason":null}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7,"total_tokens":19}}"#,
                "[DONE]",
            ],
        );

        assert_eq!(fragments[0], StreamFragment::Text("Let me check".into()));
        assert_eq!(
            fragments[1],
            StreamFragment::ToolCallDelta {
                id: "call_1".into(),
                name: Some("lookup".into()),
                arguments: String::new(),
            }
        );
        let response = LLMResponse::from_fragments(fragments.clone());
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.input_tokens, 12);
        assert!(response.content.contains(&ContentBlock::ToolUse {
            id: "call_1".into(),
            name: "lookup".into(),
            input: json!({"id": 42}),
        }));
        assert!(fragments.contains(&StreamFragment::ToolCallComplete {
            id: "call_1".into()
        }));
    }

    #[test]
    fn test_malformed_chunk_becomes_parse_error() {
        let fragments = decode(
            &OpenAIAdapter::new(),
            &[
                r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
                r#"{"choices":[{"delta":"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":3,"function":{"arguments":"{}"}}]}}]}"#,
            ],
        );
        assert_eq!(fragments[0], StreamFragment::Text("ok".into()));
        assert!(matches!(fragments[1], StreamFragment::ParseError { .. }));
        assert!(matches!(
            &fragments[2],
            StreamFragment::ParseError { message, .. } if message.contains("unknown index 3")
        ));
    }

    #[test]
    fn test_content_filter_emits_safety_warning() {
        let fragments = decode(
            &OpenAIAdapter::new(),
            &[r#"{"choices":[{"delta":{},"finish_reason":"content_filter"}]}"#],
        );
        assert!(matches!(
            &fragments[0],
            StreamFragment::SafetyWarning(w) if w.category == "content_filter"
        ));
        assert_eq!(
            fragments[1],
            StreamFragment::Finish(FinishReason::ContentFilter)
        );
    }

    #[test]
    fn test_parse_non_streaming_response() {
        let body = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_9", "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"id\":1}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        }"#;
        let response = OpenAIAdapter::new()
            .parse_response(&mut DecodeState::default(), body)
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.output_tokens, 3);
        assert_eq!(
            response.content,
            vec![ContentBlock::ToolUse {
                id: "call_9".into(),
                name: "lookup".into(),
                input: json!({"id": 1}),
            }]
        );

        let error = OpenAIAdapter::new()
            .parse_response(&mut DecodeState::default(), "not json")
            .unwrap_err();
        assert!(matches!(error, ApiError::Decode(_)));
    }
}
