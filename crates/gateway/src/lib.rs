//! Streaming orchestration core of the LLM gateway
//!
//! This crate implements:
//! - `RequestThrottler`: bounded, first come first served outbound concurrency
//!   per model id and per tool id
//! - `StreamingHandler`: turns provider fragments into events and tool calls
//! - `ToolExecutor`: the bounded tool-calling loop of one turn
//! - `EventEmitter`: the ordered, provider independent event stream
//! - `ChatOrchestrator`: the entry point choosing streamed or buffered delivery
//!
//! Provider translation and HTTP live in the `llm` crate.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod stream_handler;
pub mod throttle;
pub mod tools;
pub mod turn;


pub use config::{GatewayConfig, StreamLimits, ThrottleConfig};
pub use error::GatewayError;
pub use events::{EventEmitter, EventEnvelope, StreamEvent, CANCELLED_FINISH_REASON};
pub use executor::{ExecutorState, ToolExecutor, TurnSettings};
pub use orchestrator::{ChatCompletion, ChatOrchestrator, ChatReply, ChatRequest, TurnHandle};
pub use stream_handler::{StreamOutcome, StreamingHandler, ToolCallAccumulator};
pub use throttle::{RequestThrottler, ThrottleKey, ThrottlePermit};
pub use tools::{FnTool, RegisteredTool, ToolContext, ToolHandler, ToolSet};
pub use turn::{ChatTurn, TurnStatus};
