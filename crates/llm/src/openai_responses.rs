//! OpenAI Responses API adapter.
//!
//! Unlike chat completions, tools use the internally-tagged, flat descriptor
//! shape `{"type": "function", "name": ...}` and history is a list of typed
//! input items.

use crate::adapter::{self, DecodeState, ProviderAdapter, WireRequest};
use crate::factory::ProviderKind;
use crate::openai::{accepts_temperature, data_url};
use crate::provider_config::ModelConfig;
use crate::{
    ApiError, Citation, ContentBlock, FinishReason, LLMRequest, LLMResponse, MessageRole,
    SafetyWarning, StreamFragment, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAIResponsesAdapter;

/// Input item for the Responses API
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseInputItem {
    Message {
        role: String,
        content: Vec<ResponseContentItem>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

/// Content item within messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentItem {
    InputText { text: String },
    InputImage { image_url: String },
    OutputText { text: String },
}

/// Response structure from the Responses API
#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<ResponseOutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

/// Output item from the response
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseOutputItem {
    Message {
        #[serde(default)]
        content: Vec<ResponseOutputContent>,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<ReasoningSummary>,
    },
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    ImageGenerationCall {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        output_format: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Content within output messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseOutputContent {
    OutputText {
        text: String,
        #[serde(default)]
        annotations: Vec<ResponseAnnotation>,
    },
    Refusal {
        refusal: String,
    },
    #[serde(other)]
    Other,
}

/// Reasoning summary item
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReasoningSummary {
    SummaryText { text: String },
}

#[derive(Debug, Deserialize)]
struct ResponseAnnotation {
    #[serde(rename = "type")]
    annotation_type: String,
    #[serde(default)]
    start_index: Option<usize>,
    #[serde(default)]
    end_index: Option<usize>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Usage information from the response
#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

/// Streaming event from the Responses API
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    response: Option<serde_json::Value>,
    #[serde(default)]
    item: Option<serde_json::Value>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    annotation: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl From<ResponsesUsage> for Usage {
    fn from(usage: ResponsesUsage) -> Self {
        Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage
                .input_tokens_details
                .map(|details| details.cached_tokens)
                .unwrap_or(0),
        }
    }
}

impl ResponseAnnotation {
    fn into_citation(self) -> Option<Citation> {
        if self.annotation_type != "url_citation" {
            return None;
        }
        Some(Citation {
            start: self.start_index,
            end: self.end_index,
            text: None,
            url: self.url,
            title: self.title,
        })
    }
}

impl OpenAIResponsesAdapter {
    fn convert_messages(request: &LLMRequest) -> Vec<ResponseInputItem> {
        let mut items = Vec::new();
        for message in &request.messages {
            let role = match message.role {
                MessageRole::Assistant => "assistant",
                MessageRole::User | MessageRole::Tool => "user",
            };
            let mut content = Vec::new();

            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => content.push(match message.role {
                        MessageRole::Assistant => ResponseContentItem::OutputText {
                            text: text.clone(),
                        },
                        _ => ResponseContentItem::InputText { text: text.clone() },
                    }),
                    ContentBlock::Image { media_type, data } => {
                        if message.role != MessageRole::Assistant {
                            content.push(ResponseContentItem::InputImage {
                                image_url: data_url(media_type, data),
                            });
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        items.push(ResponseInputItem::FunctionCall {
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: input.to_string(),
                        })
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content: output,
                        ..
                    } => items.push(ResponseInputItem::FunctionCallOutput {
                        call_id: tool_use_id.clone(),
                        output: output.clone(),
                    }),
                    ContentBlock::Thinking { .. } => {}
                }
            }

            if !content.is_empty() {
                items.push(ResponseInputItem::Message {
                    role: role.to_string(),
                    content,
                });
            }
        }
        items
    }

    fn finish_from_response(
        state: &DecodeState,
        status: Option<&str>,
        incomplete_reason: Option<&str>,
    ) -> FinishReason {
        match (status, incomplete_reason) {
            (Some("incomplete"), Some("max_output_tokens")) => FinishReason::Length,
            (Some("incomplete"), Some("content_filter")) => FinishReason::ContentFilter,
            (Some("incomplete"), Some(other)) => FinishReason::Other(other.to_string()),
            _ if state.saw_tool_call() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    fn image_fragment(result: Option<String>, output_format: Option<String>) -> Option<StreamFragment> {
        let data = result.filter(|data| !data.is_empty())?;
        let format = output_format.unwrap_or_else(|| "png".to_string());
        Some(StreamFragment::Image {
            media_type: format!("image/{format}"),
            data,
        })
    }

    fn handle_item_added(state: &mut DecodeState, item: serde_json::Value) -> Vec<StreamFragment> {
        match serde_json::from_value::<ResponseOutputItem>(item) {
            Ok(ResponseOutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            }) => {
                let key = id.unwrap_or_else(|| call_id.clone());
                state.register_call(key, call_id.clone(), name.clone());
                vec![StreamFragment::ToolCallDelta {
                    id: call_id,
                    name: Some(name),
                    arguments,
                }]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![adapter::parse_error("output_item.added", e)],
        }
    }

    fn handle_item_done(state: &mut DecodeState, item: serde_json::Value) -> Vec<StreamFragment> {
        match serde_json::from_value::<ResponseOutputItem>(item) {
            Ok(ResponseOutputItem::FunctionCall { id, call_id, .. }) => {
                let key = id.unwrap_or(call_id);
                state
                    .complete_call(&key)
                    .map(|id| vec![StreamFragment::ToolCallComplete { id }])
                    .unwrap_or_default()
            }
            Ok(ResponseOutputItem::ImageGenerationCall {
                result,
                output_format,
            }) => Self::image_fragment(result, output_format)
                .into_iter()
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => vec![adapter::parse_error("output_item.done", e)],
        }
    }

    fn handle_completed(
        state: &mut DecodeState,
        response: Option<serde_json::Value>,
    ) -> Vec<StreamFragment> {
        let response = match response.map(serde_json::from_value::<ResponsesResponse>) {
            Some(Ok(response)) => response,
            Some(Err(e)) => return vec![adapter::parse_error("response.completed", e)],
            None => {
                return vec![StreamFragment::Finish(Self::finish_from_response(
                    state, None, None,
                ))]
            }
        };

        let mut fragments: Vec<StreamFragment> = state
            .complete_all_calls()
            .into_iter()
            .map(|id| StreamFragment::ToolCallComplete { id })
            .collect();
        if let Some(usage) = response.usage {
            fragments.push(StreamFragment::Usage(usage.into()));
        }
        let reason = Self::finish_from_response(
            state,
            response.status.as_deref(),
            response
                .incomplete_details
                .as_ref()
                .and_then(|details| details.reason.as_deref()),
        );
        if reason == FinishReason::ContentFilter && state.first_warning("content_filter") {
            fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                category: "content_filter".to_string(),
                detail: "Response was stopped by the provider's content filter".to_string(),
            }));
        }
        fragments.push(StreamFragment::Finish(reason));
        fragments
    }
}

impl ProviderAdapter for OpenAIResponsesAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAIResponses
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        let input = serde_json::to_value(Self::convert_messages(request))
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let mut body = json!({
            "model": model.model,
            "input": input,
            "store": false,
            "stream": streaming,
        });

        if !request.system_prompt.is_empty() {
            body["instructions"] = json!(request.system_prompt);
        }
        if let Some(max_tokens) = adapter::max_output_tokens(model, request) {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = adapter::temperature(model, request) {
            if accepts_temperature(model) {
                body["temperature"] = json!(temperature);
            } else {
                debug!("Omitting temperature for model {}", model.model);
            }
        }

        let mut tools: Vec<serde_json::Value> = request
            .tool_definitions()
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                })
            })
            .collect();
        if request.options.grounding {
            tools.push(json!({"type": "web_search"}));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        if let Some(schema) = &request.options.response_schema {
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true
                }
            });
        }

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(api_key) = &model.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }

        Ok(WireRequest {
            url: format!("{}/responses", model.base_url()),
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
        trace!("Received stream event: '{}'", event.event_type);

        match event.event_type.as_str() {
            "response.output_text.delta" => event
                .delta
                .filter(|delta| !delta.is_empty())
                .map(StreamFragment::Text)
                .into_iter()
                .collect(),
            "response.reasoning_summary_text.delta" => event
                .delta
                .filter(|delta| !delta.is_empty())
                .map(StreamFragment::Thinking)
                .into_iter()
                .collect(),
            "response.output_item.added" => match event.item {
                Some(item) => Self::handle_item_added(state, item),
                None => Vec::new(),
            },
            "response.function_call_arguments.delta" => {
                let key = event.item_id.unwrap_or_default();
                match state.call(&key) {
                    Some(call) => vec![StreamFragment::ToolCallDelta {
                        id: call.id.clone(),
                        name: None,
                        arguments: event.delta.unwrap_or_default(),
                    }],
                    None => vec![StreamFragment::ParseError {
                        message: format!("Arguments for unknown function call item '{key}'"),
                        tool_call_id: None,
                    }],
                }
            }
            "response.output_item.done" => match event.item {
                Some(item) => Self::handle_item_done(state, item),
                None => Vec::new(),
            },
            "response.output_text.annotation.added" => event
                .annotation
                .and_then(|value| serde_json::from_value::<ResponseAnnotation>(value).ok())
                .and_then(ResponseAnnotation::into_citation)
                .map(StreamFragment::Grounding)
                .into_iter()
                .collect(),
            "response.refusal.delta" => {
                if state.first_warning("refusal") {
                    vec![StreamFragment::SafetyWarning(SafetyWarning {
                        category: "refusal".to_string(),
                        detail: event.delta.unwrap_or_default(),
                    })]
                } else {
                    Vec::new()
                }
            }
            "response.completed" | "response.incomplete" => {
                Self::handle_completed(state, event.response)
            }
            "response.failed" | "error" => {
                let message = event
                    .message
                    .or_else(|| {
                        event
                            .response
                            .as_ref()
                            .and_then(|r| r.pointer("/error/message"))
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "Response failed".to_string());
                vec![StreamFragment::ProviderError(message)]
            }
            other => {
                trace!("Ignoring stream event type '{}'", other);
                Vec::new()
            }
        }
    }

    fn parse_response(
        &self,
        state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        let response: ResponsesResponse =
            serde_json::from_str(body).map_err(|e| adapter::decode_error(body, e))?;

        let mut fragments = Vec::new();
        for item in response.output {
            match item {
                ResponseOutputItem::Message { content } => {
                    for part in content {
                        match part {
                            ResponseOutputContent::OutputText { text, annotations } => {
                                fragments.push(StreamFragment::Text(text));
                                fragments.extend(
                                    annotations
                                        .into_iter()
                                        .filter_map(ResponseAnnotation::into_citation)
                                        .map(StreamFragment::Grounding),
                                );
                            }
                            ResponseOutputContent::Refusal { refusal } => {
                                fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                                    category: "refusal".to_string(),
                                    detail: refusal,
                                }))
                            }
                            ResponseOutputContent::Other => {}
                        }
                    }
                }
                ResponseOutputItem::Reasoning { summary } => {
                    for ReasoningSummary::SummaryText { text } in summary {
                        fragments.push(StreamFragment::Thinking(text));
                    }
                }
                ResponseOutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                } => {
                    state.register_call(call_id.clone(), call_id.clone(), name.clone());
                    fragments.push(StreamFragment::ToolCallDelta {
                        id: call_id,
                        name: Some(name),
                        arguments,
                    });
                }
                ResponseOutputItem::ImageGenerationCall {
                    result,
                    output_format,
                } => fragments.extend(Self::image_fragment(result, output_format)),
                ResponseOutputItem::Other => {}
            }
        }

        if let Some(usage) = response.usage {
            fragments.push(StreamFragment::Usage(usage.into()));
        }
        fragments.push(StreamFragment::Finish(Self::finish_from_response(
            state,
            response.status.as_deref(),
            response
                .incomplete_details
                .as_ref()
                .and_then(|details| details.reason.as_deref()),
        )));

        Ok(LLMResponse::from_fragments(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatOptions, Message, ResponseSchema, ToolDefinition};

    fn model() -> ModelConfig {
        ModelConfig::new(ProviderKind::OpenAIResponses, "gpt-5")
    }

    #[test]
    fn test_request_uses_flat_tools_and_items() {
        let request = LLMRequest {
            system_prompt: "sys".into(),
            messages: vec![
                Message::user("Look up 42"),
                Message::assistant(vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "lookup".into(),
                    input: json!({"id": 42}),
                }]),
                Message::tool_results(vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    tool_name: "lookup".into(),
                    content: "found".into(),
                    is_error: false,
                }]),
            ],
            tools: Some(vec![ToolDefinition {
                name: "lookup".into(),
                description: "Find a record".into(),
                parameters: json!({"type": "object"}),
            }]),
            options: ChatOptions {
                grounding: true,
                temperature: Some(0.5),
                max_output_tokens: Some(256),
                response_schema: Some(ResponseSchema {
                    name: "answer".into(),
                    schema: json!({"type": "object"}),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let wire = OpenAIResponsesAdapter
            .create_request(&model(), &request, true)
            .unwrap();

        assert_eq!(wire.url, "https://api.openai.com/v1/responses");
        assert_eq!(wire.body["instructions"], "sys");
        assert_eq!(wire.body["tools"][0]["type"], "function");
        assert_eq!(wire.body["tools"][0]["name"], "lookup");
        assert!(wire.body["tools"][0].get("function").is_none());
        assert_eq!(wire.body["tools"][1]["type"], "web_search");
        assert_eq!(wire.body["max_output_tokens"], 256);
        assert!(wire.body.get("temperature").is_none());
        assert_eq!(wire.body["text"]["format"]["type"], "json_schema");

        let input = wire.body["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[0]["content"][0]["type"], "input_text");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["arguments"], "{\"id\":42}");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "found");
    }

    #[test]
    fn test_streaming_events() {
        let adapter = OpenAIResponsesAdapter;
        let mut state = DecodeState::default();
        let lines = [
            r#"{"type":"response.created","response":{"id":"resp_1"}}"#,
            r#"{"type":"response.reasoning_summary_text.delta","delta":"Thinking"}"#,
            r#"{"type":"response.output_text.delta","delta":"Hi"}"#,
            r#"{"type":"response.output_text.annotation.added","annotation":{"type":"url_citation","url":"https://example.com","title":"Example","start_index":0,"end_index":2}}"#,
            r#"{"type":"response.output_item.added","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":""}}"#,
            r#"{"type":"response.function_call_arguments.delta","item_id":"fc_1","delta":"{\"id\":42}"}"#,
            r#"{"type":"response.output_item.done","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"lookup","arguments":"{\"id\":42}"}}"#,
            r#"{"type":"response.output_item.done","item":{"type":"image_generation_call","id":"ig_1","result":"aGVsbG8="}}"#,
            r#"{"type":"response.completed","response":{"status":"completed","output":[],"usage":{"input_tokens":10,"output_tokens":4,"total_tokens":14}}}"#,
        ];
        let fragments: Vec<_> = lines
            .iter()
            .flat_map(|line| adapter.parse_stream_chunk(&mut state, line))
            .collect();

        assert_eq!(
            fragments,
            vec![
                StreamFragment::Thinking("Thinking".into()),
                StreamFragment::Text("Hi".into()),
                StreamFragment::Grounding(Citation {
                    start: Some(0),
                    end: Some(2),
                    text: None,
                    url: Some("https://example.com".into()),
                    title: Some("Example".into()),
                }),
                StreamFragment::ToolCallDelta {
                    id: "call_1".into(),
                    name: Some("lookup".into()),
                    arguments: String::new(),
                },
                StreamFragment::ToolCallDelta {
                    id: "call_1".into(),
                    name: None,
                    arguments: "{\"id\":42}".into(),
                },
                StreamFragment::ToolCallComplete {
                    id: "call_1".into()
                },
                StreamFragment::Image {
                    media_type: "image/png".into(),
                    data: "aGVsbG8=".into(),
                },
                StreamFragment::Usage(Usage {
                    input_tokens: 10,
                    output_tokens: 4,
                    ..Default::default()
                }),
                StreamFragment::Finish(FinishReason::ToolCalls),
            ]
        );
    }

    #[test]
    fn test_incomplete_response_maps_to_length() {
        let mut state = DecodeState::default();
        let fragments = OpenAIResponsesAdapter.parse_stream_chunk(
            &mut state,
            r#"{"type":"response.incomplete","response":{"status":"incomplete","incomplete_details":{"reason":"max_output_tokens"},"output":[]}}"#,
        );
        assert_eq!(
            fragments.last(),
            Some(&StreamFragment::Finish(FinishReason::Length))
        );
    }

    #[test]
    fn test_parse_non_streaming_response() {
        let body = r#"{
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "reasoning", "id": "rs_1", "summary": [{"type": "summary_text", "text": "Plan"}]},
                {"type": "web_search_call", "id": "ws_1", "status": "completed"},
                {"type": "message", "id": "msg_1", "role": "assistant", "content": [
                    {"type": "output_text", "text": "Answer", "annotations": []}
                ]}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 2, "total_tokens": 5}
        }"#;
        let response = OpenAIResponsesAdapter
            .parse_response(&mut DecodeState::default(), body)
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(
            response.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "Plan".into(),
                    signature: String::new(),
                },
                ContentBlock::Text {
                    text: "Answer".into()
                },
            ]
        );
        assert_eq!(response.usage.input_tokens, 3);
    }
}
