use crate::adapter::Provider;
use crate::anthropic::AnthropicAdapter;
use crate::mistralai::MistralAdapter;
use crate::openai::OpenAIAdapter;
use crate::openai_responses::OpenAIResponsesAdapter;
use crate::vertex::GeminiAdapter;
use clap::ValueEnum;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider identifier attached to every model configuration
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    #[value(name = "openai")]
    OpenAI,
    #[serde(rename = "openai-responses")]
    #[value(name = "openai-responses")]
    OpenAIResponses,
    Anthropic,
    Gemini,
    #[serde(rename = "mistralai")]
    #[value(name = "mistralai")]
    MistralAI,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAI,
        ProviderKind::OpenAIResponses,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::MistralAI,
    ];

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI | ProviderKind::OpenAIResponses => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::MistralAI => "https://api.mistral.ai/v1",
        }
    }

    fn create_adapter(self) -> Provider {
        match self {
            ProviderKind::OpenAI => Provider::OpenAI(OpenAIAdapter::new()),
            ProviderKind::OpenAIResponses => Provider::OpenAIResponses(OpenAIResponsesAdapter),
            ProviderKind::Anthropic => Provider::Anthropic(AnthropicAdapter),
            ProviderKind::Gemini => Provider::Gemini(GeminiAdapter),
            ProviderKind::MistralAI => Provider::MistralAI(MistralAdapter::new()),
        }
    }
}

/// Static mapping from provider identifier to its adapter.
///
/// Adapters are stateless, so one shared instance per provider serves
/// every turn.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<Provider>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let adapters = ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(kind.create_adapter())))
            .collect();
        Self { adapters }
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<Provider> {
        // Every kind is registered in `new`
        match self.adapters.get(&kind) {
            Some(adapter) => adapter.clone(),
            None => Arc::new(kind.create_adapter()),
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
