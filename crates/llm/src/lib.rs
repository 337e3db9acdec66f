//! LLM integration module providing abstraction over different LLM providers
//!
//! This module implements:
//! - Normalized message, tool and response types shared by all vendors
//! - The `ProviderAdapter` contract and one adapter per vendor family
//!   (OpenAI chat completions, OpenAI Responses, Anthropic, Gemini, Mistral)
//! - Server-sent event decoding for streamed responses
//! - An HTTP transport with retry handling for rate limits and transient errors
//! - Model catalog loading with environment variable substitution

#[cfg(test)]
mod tests;

mod utils;

pub mod adapter;
pub mod anthropic;
pub mod factory;
pub mod mistralai;
pub mod openai;
pub mod openai_responses;
pub mod provider_config;
pub mod streaming;
pub mod transport;
pub mod types;
pub mod vertex;

pub use adapter::{DecodeState, Provider, ProviderAdapter, WireRequest};
pub use factory::{AdapterRegistry, ProviderKind};
pub use provider_config::{ModelCatalog, ModelConfig};
pub use streaming::{ChunkStream, HttpChunkStream, ReplayChunkStream, SseDecoder};
pub use transport::{HttpTransport, Transport};
pub use types::*;

/// One normalized unit decoded from a provider response.
///
/// Adapters turn every vendor chunk into zero or more fragments; the
/// consumer never needs to know which vendor produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    /// Regular text content
    Text(String),
    /// Content identified as "thinking" (supported by some models)
    Thinking(String),
    /// Opaque signature that must accompany resubmitted thinking content
    ThinkingSignature(String),
    /// Argument fragment of a tool call. The first fragment of a call
    /// carries its name; later ones usually don't.
    ToolCallDelta {
        id: String,
        name: Option<String>,
        arguments: String,
    },
    /// The vendor signalled that a tool call's arguments are complete
    ToolCallComplete { id: String },
    /// Base64 encoded generated image
    Image { media_type: String, data: String },
    Grounding(Citation),
    SafetyWarning(SafetyWarning),
    Usage(Usage),
    Finish(FinishReason),
    /// A chunk could not be interpreted. When the damage is confined to one
    /// tool call its id is attached so only that call fails.
    ParseError {
        message: String,
        tool_call_id: Option<String>,
    },
    /// The vendor reported an error inside an otherwise healthy stream
    ProviderError(String),
}
