//! The provider adapter contract.
//!
//! An adapter is a stateless translation unit: it turns a normalized
//! `LLMRequest` into a vendor wire request and turns vendor payloads back
//! into `StreamFragment`s. Everything that must survive from one stream
//! chunk to the next lives in a `DecodeState` owned by the caller, so one
//! adapter instance is shared by all concurrent turns.

use crate::anthropic::AnthropicAdapter;
use crate::factory::ProviderKind;
use crate::mistralai::MistralAdapter;
use crate::openai::OpenAIAdapter;
use crate::openai_responses::OpenAIResponsesAdapter;
use crate::provider_config::ModelConfig;
use crate::vertex::GeminiAdapter;
use crate::{ApiError, LLMRequest, LLMResponse, StreamFragment};
use std::collections::{HashMap, HashSet};

/// A fully assembled vendor request, ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub streaming: bool,
}

impl WireRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Translation contract every vendor family satisfies
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Map the normalized history, tools and options into the vendor shape
    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError>;

    /// Decode one SSE `data:` payload into zero or more fragments.
    ///
    /// Never fails: undecodable payloads become `StreamFragment::ParseError`.
    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment>;

    /// Decode a complete non-streaming response body
    fn parse_response(&self, state: &mut DecodeState, body: &str)
        -> Result<LLMResponse, ApiError>;
}

/// Closed set of supported vendor families
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAI(OpenAIAdapter),
    OpenAIResponses(OpenAIResponsesAdapter),
    Anthropic(AnthropicAdapter),
    Gemini(GeminiAdapter),
    MistralAI(MistralAdapter),
}

impl Provider {
    fn inner(&self) -> &dyn ProviderAdapter {
        match self {
            Provider::OpenAI(adapter) => adapter,
            Provider::OpenAIResponses(adapter) => adapter,
            Provider::Anthropic(adapter) => adapter,
            Provider::Gemini(adapter) => adapter,
            Provider::MistralAI(adapter) => adapter,
        }
    }
}

impl ProviderAdapter for Provider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        self.inner().create_request(model, request, streaming)
    }

    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment> {
        self.inner().parse_stream_chunk(state, data)
    }

    fn parse_response(
        &self,
        state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        self.inner().parse_response(state, body)
    }
}

/// Vendor-side handle of a tool call that is still streaming
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub id: String,
    pub name: String,
    pub completed: bool,
}

/// Cross-chunk bookkeeping for decoding one response
#[derive(Debug, Default)]
pub struct DecodeState {
    request_id: u64,
    tool_counter: u64,
    /// Vendor key (stream index or item id) -> tool call
    calls: HashMap<String, PendingCall>,
    call_order: Vec<String>,
    /// Name of the tool used to force structured output, if any
    structured_tool: Option<String>,
    /// Vendor keys of blocks that carry structured output instead of a call
    structured_blocks: HashSet<String>,
    warned: HashSet<String>,
    saw_tool_call: bool,
}

impl DecodeState {
    pub fn for_request(request: &LLMRequest) -> Self {
        Self {
            request_id: request.request_id,
            structured_tool: request
                .options
                .response_schema
                .as_ref()
                .map(|schema| schema.name.clone()),
            ..Self::default()
        }
    }

    /// Generate a tool id for vendors that don't assign one
    pub fn next_tool_id(&mut self) -> String {
        self.tool_counter += 1;
        format!("tool-{}-{}", self.request_id, self.tool_counter)
    }

    pub fn register_call(&mut self, key: impl Into<String>, id: String, name: String) {
        let key = key.into();
        self.saw_tool_call = true;
        if self.calls.contains_key(&key) {
            return;
        }
        self.call_order.push(key.clone());
        self.calls.insert(
            key,
            PendingCall {
                id,
                name,
                completed: false,
            },
        );
    }

    pub fn call(&self, key: &str) -> Option<&PendingCall> {
        self.calls.get(key)
    }

    /// Mark a call complete, returning its id the first time only
    pub fn complete_call(&mut self, key: &str) -> Option<String> {
        let call = self.calls.get_mut(key)?;
        if call.completed {
            return None;
        }
        call.completed = true;
        Some(call.id.clone())
    }

    /// Complete every still-open call in registration order
    pub fn complete_all_calls(&mut self) -> Vec<String> {
        let keys = self.call_order.clone();
        keys.iter()
            .filter_map(|key| self.complete_call(key))
            .collect()
    }

    pub fn saw_tool_call(&self) -> bool {
        self.saw_tool_call
    }

    pub fn is_structured_tool(&self, name: &str) -> bool {
        self.structured_tool.as_deref() == Some(name)
    }

    pub fn mark_structured_block(&mut self, key: impl Into<String>) {
        self.structured_blocks.insert(key.into());
    }

    pub fn is_structured_block(&self, key: &str) -> bool {
        self.structured_blocks.contains(key)
    }

    /// True the first time a warning category is reported for this response
    pub fn first_warning(&mut self, category: &str) -> bool {
        self.warned.insert(category.to_string())
    }
}

/// Resolve the output token budget: request first, then model default
pub(crate) fn max_output_tokens(model: &ModelConfig, request: &LLMRequest) -> Option<u32> {
    request.options.max_output_tokens.or(model.max_output_tokens)
}

/// Resolve the sampling temperature: request first, then model default
pub(crate) fn temperature(model: &ModelConfig, request: &LLMRequest) -> Option<f32> {
    request.options.temperature.or(model.temperature)
}

pub(crate) fn decode_error(body: &str, error: serde_json::Error) -> ApiError {
    let preview: String = body.chars().take(200).collect();
    ApiError::Decode(format!("{error} in body: {preview}"))
}

pub(crate) fn parse_error(data: &str, error: impl std::fmt::Display) -> StreamFragment {
    let preview: String = data.chars().take(200).collect();
    StreamFragment::ParseError {
        message: format!("{error}: {preview}"),
        tool_call_id: None,
    }
}
