use crate::StreamFragment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Tracks token usage for a request/response pair
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
pub struct Usage {
    /// Number of tokens in the input (prompt)
    pub input_tokens: u32,
    /// Number of tokens in the output (completion)
    pub output_tokens: u32,
    /// Number of tokens written to cache
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    /// Number of tokens read from cache
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

impl Usage {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Merge a usage report from the same response.
    ///
    /// Vendors report usage cumulatively (Anthropic sends input tokens with
    /// `message_start` and output tokens with `message_delta`), so each field
    /// keeps the largest value seen.
    pub fn absorb(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(other.cache_read_input_tokens);
    }

    /// Add the usage of another response (one loop iteration) to this total
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// JSON schema the model output must conform to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseSchema {
    /// Identifier passed to vendors that require a schema name
    pub name: String,
    pub schema: serde_json::Value,
}

/// Per-request generation options. Every field is optional, adapters only
/// send what the target vendor and model family accept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<ResponseSchema>,
    /// Enable the vendor's built-in search/grounding tool
    #[serde(default)]
    pub grounding: bool,
    /// Custom text sequences that will cause the model to stop generating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Generic request structure that can be mapped to different providers
#[derive(Debug, Clone, Default)]
pub struct LLMRequest {
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub tools: Option<Vec<ToolDefinition>>,
    pub options: ChatOptions,
    /// Sequence number of this request within a turn, used for stable tool ids
    pub request_id: u64,
}

impl LLMRequest {
    pub fn tool_definitions(&self) -> &[ToolDefinition] {
        self.tools.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: results,
        }
    }

    /// Concatenated text blocks of this message
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    /// Base64 encoded image data
    #[serde(rename = "image")]
    Image { media_type: String, data: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        /// Some vendors (Gemini) match results by function name instead of id
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Grounding/citation annotation attached to the assistant output
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Citation {
    /// Start offset of the supported span in the assistant text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    /// Supported or cited text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SafetyWarning {
    pub category: String,
    pub detail: String,
}

/// Normalized terminal classification of one provider response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(reason) => reason,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic response structure, the collapsed form of a stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LLMResponse {
    pub content: Vec<ContentBlock>,
    pub citations: Vec<Citation>,
    pub safety_warnings: Vec<SafetyWarning>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl LLMResponse {
    /// Replay a complete response as the fragment sequence a stream would
    /// have produced, so both delivery modes share one accumulation path.
    pub fn into_fragments(self) -> Vec<StreamFragment> {
        let mut fragments = Vec::new();
        for block in self.content {
            match block {
                ContentBlock::Text { text } => fragments.push(StreamFragment::Text(text)),
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    fragments.push(StreamFragment::Thinking(thinking));
                    if !signature.is_empty() {
                        fragments.push(StreamFragment::ThinkingSignature(signature));
                    }
                }
                ContentBlock::Image { media_type, data } => {
                    fragments.push(StreamFragment::Image { media_type, data })
                }
                ContentBlock::ToolUse { id, name, input } => {
                    // Unparseable vendor arguments are kept as the raw string
                    let arguments = match input {
                        serde_json::Value::String(raw) => raw,
                        other => other.to_string(),
                    };
                    fragments.push(StreamFragment::ToolCallDelta {
                        id: id.clone(),
                        name: Some(name),
                        arguments,
                    });
                    fragments.push(StreamFragment::ToolCallComplete { id });
                }
                ContentBlock::ToolResult { .. } => {}
            }
        }
        fragments.extend(self.citations.into_iter().map(StreamFragment::Grounding));
        fragments.extend(
            self.safety_warnings
                .into_iter()
                .map(StreamFragment::SafetyWarning),
        );
        fragments.push(StreamFragment::Usage(self.usage));
        fragments.push(StreamFragment::Finish(self.finish_reason));
        fragments
    }

    /// Collapse a fragment sequence into a final response object
    pub fn from_fragments(fragments: impl IntoIterator<Item = StreamFragment>) -> Self {
        let mut response = LLMResponse::default();
        let mut text = String::new();
        let mut thinking: Option<(String, String)> = None;
        let mut calls: Vec<(String, Option<String>, String)> = Vec::new();
        let mut call_index: HashMap<String, usize> = HashMap::new();

        for fragment in fragments {
            match fragment {
                StreamFragment::Text(delta) => text.push_str(&delta),
                StreamFragment::Thinking(delta) => {
                    thinking.get_or_insert_with(Default::default).0.push_str(&delta)
                }
                StreamFragment::ThinkingSignature(signature) => {
                    thinking.get_or_insert_with(Default::default).1 = signature
                }
                StreamFragment::ToolCallDelta {
                    id,
                    name,
                    arguments,
                } => match call_index.get(&id) {
                    Some(&index) => {
                        let call = &mut calls[index];
                        if call.1.is_none() {
                            call.1 = name;
                        }
                        call.2.push_str(&arguments);
                    }
                    None => {
                        call_index.insert(id.clone(), calls.len());
                        calls.push((id, name, arguments));
                    }
                },
                StreamFragment::ToolCallComplete { .. } | StreamFragment::ParseError { .. } => {}
                StreamFragment::Image { media_type, data } => response
                    .content
                    .push(ContentBlock::Image { media_type, data }),
                StreamFragment::Grounding(citation) => response.citations.push(citation),
                StreamFragment::SafetyWarning(warning) => response.safety_warnings.push(warning),
                StreamFragment::Usage(usage) => response.usage.absorb(&usage),
                StreamFragment::Finish(reason) => response.finish_reason = reason,
                StreamFragment::ProviderError(_) => {}
            }
        }

        let mut content = Vec::new();
        if let Some((thinking, signature)) = thinking {
            content.push(ContentBlock::Thinking {
                thinking,
                signature,
            });
        }
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        content.append(&mut response.content);
        for (id, name, arguments) in calls {
            let input = if arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&arguments)
                    .unwrap_or(serde_json::Value::String(arguments))
            };
            content.push(ContentBlock::ToolUse {
                id,
                name: name.unwrap_or_default(),
                input,
            });
        }
        response.content = content;
        response
    }
}

/// Common error types for all LLM providers
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Service overloaded: {0}")]
    Overloaded(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Errors worth another attempt before any response byte was consumed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimit(_)
                | ApiError::ServiceError(_)
                | ApiError::Overloaded(_)
                | ApiError::NetworkError(_)
        )
    }
}

/// Context wrapper for API errors that includes the server's retry hint
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApiErrorContext {
    pub error: ApiError,
    pub retry_after: Option<Duration>,
}

impl From<ApiError> for ApiErrorContext {
    fn from(error: ApiError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}
