use super::openai::{OpenAIAdapter, RequestCustomizer};
use crate::adapter::{DecodeState, ProviderAdapter, WireRequest};
use crate::factory::ProviderKind;
use crate::provider_config::ModelConfig;
use crate::{ApiError, LLMRequest, LLMResponse, StreamFragment};
use std::sync::Arc;

/// MistralAI request customizer that strips unsupported fields
pub struct MistralAiRequestCustomizer;

impl RequestCustomizer for MistralAiRequestCustomizer {
    fn customize_request(&self, request: &mut serde_json::Value) {
        if let Some(obj) = request.as_object_mut() {
            // Mistral streams usage unconditionally and rejects the option
            obj.remove("stream_options");
            obj.remove("prompt_cache_key");
        }
    }

    fn max_tokens_field(&self) -> &'static str {
        "max_tokens"
    }
}

/// Mistral speaks the chat completions dialect, so decoding is shared
#[derive(Debug, Clone)]
pub struct MistralAdapter {
    inner: OpenAIAdapter,
}

impl MistralAdapter {
    pub fn new() -> Self {
        Self {
            inner: OpenAIAdapter::with_customizer(
                ProviderKind::MistralAI,
                Arc::new(MistralAiRequestCustomizer),
            ),
        }
    }
}

impl Default for MistralAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for MistralAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MistralAI
    }

    fn create_request(
        &self,
        model: &ModelConfig,
        request: &LLMRequest,
        streaming: bool,
    ) -> Result<WireRequest, ApiError> {
        self.inner.create_request(model, request, streaming)
    }

    fn parse_stream_chunk(&self, state: &mut DecodeState, data: &str) -> Vec<StreamFragment> {
        self.inner.parse_stream_chunk(state, data)
    }

    fn parse_response(
        &self,
        state: &mut DecodeState,
        body: &str,
    ) -> Result<LLMResponse, ApiError> {
        self.inner.parse_response(state, body)
    }
}
