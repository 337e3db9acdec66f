//! Gemini (generateContent) adapter.

use crate::adapter::{self, DecodeState, ProviderAdapter, WireRequest};
use crate::factory::ProviderKind;
use crate::provider_config::ModelConfig;
use crate::{
    ApiError, Citation, ContentBlock, FinishReason, LLMRequest, LLMResponse, MessageRole,
    SafetyWarning, StreamFragment, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VertexRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<VertexContent>,
    contents: Vec<VertexContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct VertexContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<VertexPart>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VertexPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<VertexInlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<VertexFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<VertexFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VertexFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct VertexFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexResponse {
    #[serde(default)]
    candidates: Vec<VertexCandidate>,
    #[serde(default)]
    usage_metadata: Option<VertexUsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    cached_content_token_count: Option<u32>,
    #[serde(default)]
    thoughts_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VertexCandidate {
    #[serde(default)]
    content: Option<VertexContent>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
    #[serde(default)]
    grounding_supports: Vec<GroundingSupport>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingSupport {
    #[serde(default)]
    segment: Option<Segment>,
    #[serde(default)]
    grounding_chunk_indices: Vec<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Segment {
    #[serde(default)]
    start_index: Option<usize>,
    #[serde(default)]
    end_index: Option<usize>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SafetyRating {
    category: String,
    #[serde(default)]
    probability: Option<String>,
    #[serde(default)]
    blocked: bool,
}

/// Finish reasons that mean the output was withheld for safety
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

/// JSON schema keywords Gemini's OpenAPI-subset schema rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "$schema", "strict"];

fn sanitize_schema(schema: &serde_json::Value) -> serde_json::Value {
    match schema {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sanitize_schema(value)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_schema).collect())
        }
        other => other.clone(),
    }
}

impl From<VertexUsageMetadata> for Usage {
    fn from(usage: VertexUsageMetadata) -> Self {
        Usage {
            input_tokens: usage.prompt_token_count,
            // Thinking tokens are billed as output
            output_tokens: usage.candidates_token_count + usage.thoughts_token_count.unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: usage.cached_content_token_count.unwrap_or(0),
        }
    }
}

impl GeminiAdapter {
    fn convert_part(block: &ContentBlock) -> VertexPart {
        match block {
            ContentBlock::Text { text } => VertexPart {
                text: Some(text.clone()),
                ..Default::default()
            },
            ContentBlock::Image { media_type, data } => VertexPart {
                inline_data: Some(VertexInlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
            ContentBlock::Thinking {
                thinking,
                signature,
            } => VertexPart {
                text: Some(thinking.clone()),
                thought: Some(true),
                thought_signature: Some(signature.clone()).filter(|s| !s.is_empty()),
                ..Default::default()
            },
            ContentBlock::ToolUse { name, input, .. } => VertexPart {
                function_call: Some(VertexFunctionCall {
                    id: None,
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..Default::default()
            },
            ContentBlock::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => VertexPart {
                function_response: Some(VertexFunctionResponse {
                    name: tool_name.clone(),
                    response: if *is_error {
                        json!({"error": content})
                    } else {
                        json!({"result": content})
                    },
                }),
                ..Default::default()
            },
        }
    }

    fn convert_messages(request: &LLMRequest) -> Vec<VertexContent> {
        request
            .messages
            .iter()
            .map(|message| VertexContent {
                role: Some(
                    match message.role {
                        MessageRole::Assistant => "model",
                        MessageRole::User | MessageRole::Tool => "user",
                    }
                    .to_string(),
                ),
                parts: message
                    .content
                    .iter()
                    .map(Self::convert_part)
                    .collect(),
            })
            .filter(|content| !content.parts.is_empty())
            .collect()
    }

    fn citations(metadata: GroundingMetadata) -> Vec<Citation> {
        let source = |index: usize| {
            metadata
                .grounding_chunks
                .get(index)
                .and_then(|chunk| chunk.web.as_ref())
        };

        if metadata.grounding_supports.is_empty() {
            return metadata
                .grounding_chunks
                .iter()
                .filter_map(|chunk| chunk.web.as_ref())
                .map(|web| Citation {
                    url: web.uri.clone(),
                    title: web.title.clone(),
                    ..Default::default()
                })
                .collect();
        }

        let mut citations = Vec::new();
        for support in &metadata.grounding_supports {
            let segment = support.segment.as_ref();
            for &index in &support.grounding_chunk_indices {
                let web = source(index);
                citations.push(Citation {
                    start: segment.and_then(|s| s.start_index),
                    end: segment.and_then(|s| s.end_index),
                    text: segment.and_then(|s| s.text.clone()),
                    url: web.and_then(|w| w.uri.clone()),
                    title: web.and_then(|w| w.title.clone()),
                });
            }
        }
        citations
    }

    fn map_finish_reason(
        state: &mut DecodeState,
        reason: &str,
        fragments: &mut Vec<StreamFragment>,
    ) -> FinishReason {
        match reason {
            // Gemini reports STOP even when the turn ends in function calls
            "STOP" if state.saw_tool_call() => FinishReason::ToolCalls,
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            reason if SAFETY_FINISH_REASONS.contains(&reason) => {
                let category = reason.to_lowercase();
                if state.first_warning(&category) {
                    fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                        category,
                        detail: format!("Generation stopped with finish reason {reason}"),
                    }));
                }
                FinishReason::ContentFilter
            }
            "MALFORMED_FUNCTION_CALL" => {
                fragments.push(StreamFragment::ParseError {
                    message: "Model produced a malformed function call".to_string(),
                    tool_call_id: None,
                });
                FinishReason::Other("malformed_function_call".to_string())
            }
            other => FinishReason::Other(other.to_lowercase()),
        }
    }

    /// Convert one response object. Streams deliver a sequence of these,
    /// the non-streaming endpoint returns a single one.
    fn response_fragments(state: &mut DecodeState, response: VertexResponse) -> Vec<StreamFragment> {
        let mut fragments = Vec::new();

        if let Some(reason) = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
        {
            if state.first_warning("prompt_blocked") {
                fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                    category: "prompt_blocked".to_string(),
                    detail: reason,
                }));
            }
            fragments.push(StreamFragment::Finish(FinishReason::ContentFilter));
        }

        for candidate in response.candidates {
            let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
            for part in parts {
                if let Some(text) = part.text {
                    if part.thought == Some(true) {
                        fragments.push(StreamFragment::Thinking(text));
                    } else if !text.is_empty() {
                        fragments.push(StreamFragment::Text(text));
                    }
                }
                if let Some(inline) = part.inline_data {
                    fragments.push(StreamFragment::Image {
                        media_type: inline.mime_type,
                        data: inline.data,
                    });
                }
                if let Some(call) = part.function_call {
                    let id = call.id.unwrap_or_else(|| state.next_tool_id());
                    state.register_call(id.clone(), id.clone(), call.name.clone());
                    let arguments = if call.args.is_null() {
                        "{}".to_string()
                    } else {
                        call.args.to_string()
                    };
                    fragments.push(StreamFragment::ToolCallDelta {
                        id: id.clone(),
                        name: Some(call.name),
                        arguments,
                    });
                    if let Some(id) = state.complete_call(&id) {
                        fragments.push(StreamFragment::ToolCallComplete { id });
                    }
                } else if let Some(signature) = part.thought_signature {
                    fragments.push(StreamFragment::ThinkingSignature(signature));
                }
            }

            // Grounding arrives alongside regular text chunks, never gated
            // on the finish reason
            if let Some(metadata) = candidate.grounding_metadata {
                fragments.extend(
                    Self::citations(metadata)
                        .into_iter()
                        .map(StreamFragment::Grounding),
                );
            }

            for rating in candidate.safety_ratings {
                let flagged = rating.blocked || rating.probability.as_deref() == Some("HIGH");
                if flagged && state.first_warning(&rating.category) {
                    fragments.push(StreamFragment::SafetyWarning(SafetyWarning {
                        detail: rating
                            .probability
                            .unwrap_or_else(|| "BLOCKED".to_string()),
                        category: rating.category,
                    }));
                }
            }

            if let Some(reason) = candidate.finish_reason {
                let reason = Self::map_finish_reason(state, &reason, &mut fragments);
                fragments.push(StreamFragment::Finish(reason));
            }
        }

        if let Some(usage) = response.usage_metadata {
            fragments.push(StreamFragment::Usage(usage.into()));
        }

        fragments
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        let tool_definitions = request.tool_definitions();

        let (tools, tool_config) = if request.options.grounding {
            if !tool_definitions.is_empty() {
                // Gemini rejects google_search combined with function declarations
                warn!(
                    "Grounding enabled for {}, suppressing {} function declaration(s)",
                    model.model,
                    tool_definitions.len()
                );
            }
            (Some(vec![json!({"google_search": {}})]), None)
        } else if !tool_definitions.is_empty() {
            let declarations: Vec<_> = tool_definitions
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": sanitize_schema(&tool.parameters)
                    })
                })
                .collect();
            (
                Some(vec![json!({"functionDeclarations": declarations})]),
                Some(json!({"functionCallingConfig": {"mode": "AUTO"}})),
            )
        } else {
            (None, None)
        };

        let mut generation_config = GenerationConfig {
            temperature: adapter::temperature(model, request)
                .filter(|_| model.supports_temperature.unwrap_or(true)),
            max_output_tokens: adapter::max_output_tokens(model, request),
            stop_sequences: request.options.stop_sequences.clone(),
            ..Default::default()
        };
        if let Some(schema) = &request.options.response_schema {
            generation_config.response_mime_type = Some("application/json".to_string());
            generation_config.response_schema = Some(sanitize_schema(&schema.schema));
        }

        let vertex_request = VertexRequest {
            system_instruction: (!request.system_prompt.is_empty()).then(|| VertexContent {
                role: None,
                parts: vec![VertexPart {
                    text: Some(request.system_prompt.clone()),
                    ..Default::default()
                }],
            }),
            contents: Self::convert_messages(request),
            generation_config: Some(generation_config),
            tools,
            tool_config,
        };

        let body = serde_json::to_value(&vertex_request)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        let url = if streaming {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                model.base_url(),
                model.model
            )
        } else {
            format!("{}/models/{}:generateContent", model.base_url(), model.model)
        };

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(api_key) = &model.api_key {
            headers.push(("x-goog-api-key".to_string(), api_key.clone()));
        }

        Ok(WireRequest {
            url,
            headers,
            body,
            streaming,
        })
    }

    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment> {
        match serde_json::from_str::<VertexResponse>(data) {
            Ok(response) => {
                trace!("Received stream event: '{}'", data);
                Self::response_fragments(state, response)
            }
            Err(e) => vec![adapter::parse_error(data, e)],
        }
    }

    fn parse_response(
        &self,
        state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        let response: VertexResponse =
            serde_json::from_str(body).map_err(|e| adapter::decode_error(body, e))?;
        Ok(LLMResponse::from_fragments(Self::response_fragments(
            state, response,
        )))
    }
}
