use crate::adapter::{self, DecodeState, ProviderAdapter, WireRequest};
use crate::factory::ProviderKind;
use crate::provider_config::ModelConfig;
use crate::{
    ApiError, Citation, ContentBlock, FinishReason, LLMRequest, LLMResponse, MessageRole,
    SafetyWarning, StreamFragment, Usage,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

impl From<AnthropicUsage> for Usage {
    fn from(usage: AnthropicUsage) -> Self {
        Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: StreamContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: ContentDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: StreamErrorDetails },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorDetails {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    // Fields for text blocks
    #[serde(default)]
    text: Option<String>,
    // Fields for thinking blocks
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    // Fields for tool use blocks
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    citations: Vec<AnthropicCitation>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "signature_delta")]
    Signature { signature: String },
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(rename = "citations_delta")]
    Citation { citation: AnthropicCitation },
}

#[derive(Debug, Deserialize)]
struct AnthropicCitation {
    #[serde(default)]
    cited_text: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    document_title: Option<String>,
    #[serde(default)]
    start_char_index: Option<usize>,
    #[serde(default)]
    end_char_index: Option<usize>,
}

impl From<AnthropicCitation> for Citation {
    fn from(citation: AnthropicCitation) -> Self {
        Citation {
            start: citation.start_char_index,
            end: citation.end_char_index,
            text: citation.cited_text,
            url: citation.url,
            title: citation.title.or(citation.document_title),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<StreamContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

impl AnthropicAdapter {
    fn convert_block(block: &ContentBlock) -> Option<serde_json::Value> {
        match block {
            ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentBlock::Image { media_type, data } => Some(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            })),
            // Thinking without a signature is rejected on resubmission
            ContentBlock::Thinking {
                thinking,
                signature,
            } if !signature.is_empty() => Some(json!({
                "type": "thinking",
                "thinking": thinking,
                "signature": signature
            })),
            ContentBlock::Thinking { .. } => None,
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error
            })),
        }
    }

    /// Convert history, merging consecutive messages of the same role since
    /// tool results travel as user messages.
    fn convert_messages(request: &LLMRequest) -> Vec<serde_json::Value> {
        let mut messages: Vec<(&'static str, Vec<serde_json::Value>)> = Vec::new();
        for message in &request.messages {
            let role = match message.role {
                MessageRole::Assistant => "assistant",
                MessageRole::User | MessageRole::Tool => "user",
            };
            let blocks: Vec<_> = message
                .content
                .iter()
                .filter_map(Self::convert_block)
                .collect();
            if blocks.is_empty() {
                continue;
            }
            match messages.last_mut() {
                Some((last_role, content)) if *last_role == role => content.extend(blocks),
                _ => messages.push((role, blocks)),
            }
        }
        messages
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect()
    }

    fn map_stop_reason(
        state: &mut DecodeState,
        reason: &str,
        fragments: &mut Vec<StreamFragment>,
    ) -> FinishReason {
        match reason {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            // A forced structured-output tool is not a real tool call
            "tool_use" if state.saw_tool_call() => FinishReason::ToolCalls,
            "tool_use" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "refusal" => {
                if state.first_warning("refusal") {
                    fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                        category: "refusal".to_string(),
                        detail: "The model declined to respond".to_string(),
                    }));
                }
                FinishReason::ContentFilter
            }
            other => FinishReason::Other(other.to_string()),
        }
    }

    fn start_block(
        state: &mut DecodeState,
        index: usize,
        block: StreamContentBlock,
    ) -> Vec<StreamFragment> {
        let key = index.to_string();
        let mut fragments = Vec::new();
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = block.text.filter(|t| !t.is_empty()) {
                    fragments.push(StreamFragment::Text(text));
                }
                fragments.extend(
                    block
                        .citations
                        .into_iter()
                        .map(|c| StreamFragment::Grounding(c.into())),
                );
            }
            "thinking" => {
                if let Some(thinking) = block.thinking.filter(|t| !t.is_empty()) {
                    fragments.push(StreamFragment::Thinking(thinking));
                }
                if let Some(signature) = block.signature.filter(|s| !s.is_empty()) {
                    fragments.push(StreamFragment::ThinkingSignature(signature));
                }
            }
            "tool_use" => {
                let name = block.name.unwrap_or_default();
                if state.is_structured_tool(&name) {
                    state.mark_structured_block(key);
                    return fragments;
                }
                let id = block.id.unwrap_or_else(|| state.next_tool_id());
                state.register_call(key, id.clone(), name.clone());
                // The start block carries an empty input object, arguments
                // follow as input_json_delta
                fragments.push(StreamFragment::ToolCallDelta {
                    id,
                    name: Some(name),
                    arguments: String::new(),
                });
            }
            other => {
                // server_tool_use, web_search_tool_result, redacted_thinking
                debug!("Skipping content block of type '{}'", other);
            }
        }
        fragments
    }

    fn response_block_fragments(
        state: &mut DecodeState,
        block: StreamContentBlock,
    ) -> Vec<StreamFragment> {
        if block.block_type != "tool_use" {
            return Self::start_block(state, 0, block);
        }
        let name = block.name.unwrap_or_default();
        let input = block.input.unwrap_or_else(|| json!({}));
        if state.is_structured_tool(&name) {
            return vec![StreamFragment::Text(input.to_string())];
        }
        let id = block.id.unwrap_or_else(|| state.next_tool_id());
        state.register_call(id.clone(), id.clone(), name.clone());
        vec![
            StreamFragment::ToolCallDelta {
                id: id.clone(),
                name: Some(name),
                arguments: input.to_string(),
            },
            StreamFragment::ToolCallComplete { id },
        ]
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        let mut body = json!({
            "model": model.model,
            "max_tokens": adapter::max_output_tokens(model, request).unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": Self::convert_messages(request),
            "stream": streaming,
        });

        if !request.system_prompt.is_empty() {
            body["system"] = json!(request.system_prompt);
        }
        if let Some(temperature) = adapter::temperature(model, request) {
            if model.supports_temperature.unwrap_or(true) {
                body["temperature"] = json!(temperature);
            }
        }
        if let Some(stop) = &request.options.stop_sequences {
            body["stop_sequences"] = json!(stop);
        }

        let mut tools: Vec<serde_json::Value> = request
            .tool_definitions()
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters
                })
            })
            .collect();

        if request.options.grounding {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": 5
            }));
        }

        // Structured output is a strict tool the model is forced to call
        if let Some(schema) = &request.options.response_schema {
            tools.push(json!({
                "name": schema.name,
                "description": "Respond with a JSON object matching this schema.",
                "input_schema": schema.schema,
                "strict": true
            }));
            body["tool_choice"] = json!({"type": "tool", "name": schema.name});
        }

        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "anthropic-version".to_string(),
                ANTHROPIC_VERSION.to_string(),
            ),
        ];
        if let Some(api_key) = &model.api_key {
            headers.push(("x-api-key".to_string(), api_key.clone()));
        }

        Ok(WireRequest {
            url: format!("{}/messages", model.base_url()),
            headers,
            body,
            streaming,
        })
    }

    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment> {
        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => return vec![adapter::parse_error(data, e)],
        };
        trace!("Received stream event: {:?}", event);

        match event {
            StreamEvent::MessageStart { message } => {
                vec![StreamFragment::Usage(message.usage.into())]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => Self::start_block(state, index, content_block),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::Text { text } => vec![StreamFragment::Text(text)],
                ContentDelta::Thinking { thinking } => vec![StreamFragment::Thinking(thinking)],
                ContentDelta::Signature { signature } => {
                    vec![StreamFragment::ThinkingSignature(signature)]
                }
                ContentDelta::Citation { citation } => {
                    vec![StreamFragment::Grounding(citation.into())]
                }
                ContentDelta::InputJson { partial_json } => {
                    let key = index.to_string();
                    if state.is_structured_block(&key) {
                        return vec![StreamFragment::Text(partial_json)];
                    }
                    match state.call(&key) {
                        Some(call) => vec![StreamFragment::ToolCallDelta {
                            id: call.id.clone(),
                            name: None,
                            arguments: partial_json,
                        }],
                        None => vec![StreamFragment::ParseError {
                            message: format!("Input JSON for unknown content block {index}"),
                            tool_call_id: None,
                        }],
                    }
                }
            },
            StreamEvent::ContentBlockStop { index } => state
                .complete_call(&index.to_string())
                .map(|id| vec![StreamFragment::ToolCallComplete { id }])
                .unwrap_or_default(),
            StreamEvent::MessageDelta { delta, usage } => {
                let mut fragments = Vec::new();
                if let Some(usage) = usage {
                    fragments.push(StreamFragment::Usage(usage.into()));
                }
                if let Some(reason) = delta.stop_reason {
                    let reason = Self::map_stop_reason(state, &reason, &mut fragments);
                    fragments.push(StreamFragment::Finish(reason));
                }
                fragments
            }
            StreamEvent::MessageStop | StreamEvent::Ping => Vec::new(),
            StreamEvent::Error { error } => vec![StreamFragment::ProviderError(format!(
                "{}: {}",
                error.error_type, error.message
            ))],
        }
    }

    fn parse_response(
        &self,
        state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        let response: AnthropicResponse =
            serde_json::from_str(body).map_err(|e| adapter::decode_error(body, e))?;

        let mut fragments = Vec::new();
        for block in response.content {
            fragments.extend(Self::response_block_fragments(state, block));
        }
        fragments.push(StreamFragment::Usage(response.usage.into()));
        if let Some(reason) = response.stop_reason {
            let reason = Self::map_stop_reason(state, &reason, &mut fragments);
            fragments.push(StreamFragment::Finish(reason));
        }
        Ok(LLMResponse::from_fragments(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatOptions, Message, ResponseSchema, ToolDefinition};

    fn decode(state: &mut DecodeState, lines: &[&str]) -> Vec<StreamFragment> {
        lines
            .iter()
            .flat_map(|line| AnthropicAdapter.parse_stream_chunk(state, line))
            .collect()
    }

    fn schema_request() -> LLMRequest {
        LLMRequest {
            messages: vec![Message::user("Give me JSON")],
            options: ChatOptions {
                response_schema: Some(ResponseSchema {
                    name: "answer".into(),
                    schema: json!({"type": "object", "properties": {"value": {"type": "integer"}}}),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_request_shape() {
        let mut model = ModelConfig::new(ProviderKind::Anthropic, "claude-sonnet-4-5");
        model.api_key = Some("ak".into());
        let request = LLMRequest {
            system_prompt: "sys".into(),
            messages: vec![
                Message::user("Look up 42"),
                Message::assistant(vec![ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "lookup".into(),
                    input: json!({"id": 42}),
                }]),
                Message::tool_results(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".into(),
                    tool_name: "lookup".into(),
                    content: "boom".into(),
                    is_error: true,
                }]),
                Message::user("and now?"),
            ],
            tools: Some(vec![ToolDefinition {
                name: "lookup".into(),
                description: "Find".into(),
                parameters: json!({"type": "object"}),
            }]),
            options: ChatOptions {
                grounding: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let wire = AnthropicAdapter
            .create_request(&model, &request, true)
            .unwrap();

        assert_eq!(wire.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(wire.header("x-api-key"), Some("ak"));
        assert_eq!(wire.header("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(wire.body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(wire.body["system"], "sys");
        assert_eq!(wire.body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(wire.body["tools"][1]["type"], "web_search_20250305");

        let messages = wire.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["is_error"], true);
        assert_eq!(messages[2]["content"][1]["text"], "and now?");
    }

    #[test]
    fn test_structured_output_forces_tool_choice() {
        let model = ModelConfig::new(ProviderKind::Anthropic, "claude-sonnet-4-5");
        let wire = AnthropicAdapter
            .create_request(&model, &schema_request(), false)
            .unwrap();
        assert_eq!(wire.body["tool_choice"]["type"], "tool");
        assert_eq!(wire.body["tool_choice"]["name"], "answer");
        assert_eq!(wire.body["tools"][0]["strict"], true);
    }

    #[test]
    fn test_structured_output_stream_surfaces_as_text() {
        let mut state = DecodeState::for_request(&schema_request());
        let fragments = decode(
            &mut state,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_s","name":"answer","input":{}}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"value\":"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"7}"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            ],
        );
        let response = LLMResponse::from_fragments(fragments);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(
            response.content,
            vec![ContentBlock::Text {
                text: "{\"value\":7}".into()
            }]
        );
    }

    #[test]
    fn test_streaming_tool_use_thinking_and_citations() {
        let mut state = DecodeState::default();
        let fragments = decode(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude","usage":{"input_tokens":25,"output_tokens":1}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Hmm"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"citations_delta","citation":{"type":"web_search_result_location","cited_text":"Rust 1.0","url":"https://rust-lang.org","title":"Rust"}}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Sure"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
                r#"{"type":"ping"}"#,
                r#"{"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_1","name":"lookup","input":{}}}"#,
                r#"{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"id\": 42}"}}"#,
                r#"{"type":"content_block_stop","index":2}"#,
                r#"{"type":"content_block_stop","index":2}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":30}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );

        let completions = fragments
            .iter()
            .filter(|f| matches!(f, StreamFragment::ToolCallComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(fragments.contains(&StreamFragment::Grounding(Citation {
            start: None,
            end: None,
            text: Some("Rust 1.0".into()),
            url: Some("https://rust-lang.org".into()),
            title: Some("Rust".into()),
        })));

        let response = LLMResponse::from_fragments(fragments);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.input_tokens, 25);
        assert_eq!(response.usage.output_tokens, 30);
        assert_eq!(
            response.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "Hmm".into(),
                    signature: "sig".into(),
                },
                ContentBlock::Text {
                    text: "Sure".into()
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "lookup".into(),
                    input: json!({"id": 42}),
                },
            ]
        );
    }

    #[test]
    fn test_error_event_and_refusal() {
        let mut state = DecodeState::default();
        let fragments = decode(
            &mut state,
            &[
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"refusal"}}"#,
            ],
        );
        assert_eq!(
            fragments[0],
            StreamFragment::ProviderError("overloaded_error: Overloaded".into())
        );
        assert!(matches!(&fragments[1], StreamFragment::SafetyWarning(w) if w.category == "refusal"));
        assert_eq!(
            fragments[2],
            StreamFragment::Finish(FinishReason::ContentFilter)
        );
    }

    #[test]
    fn test_parse_non_streaming_response() {
        let body = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [
                {"type": "text", "text": "Checking"},
                {"type": "tool_use", "id": "toolu_2", "name": "lookup", "input": {"id": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }"#;
        let response = AnthropicAdapter
            .parse_response(&mut DecodeState::default(), body)
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            response.content[1],
            ContentBlock::ToolUse {
                id: "toolu_2".into(),
                name: "lookup".into(),
                input: json!({"id": 1}),
            }
        );
    }
}
