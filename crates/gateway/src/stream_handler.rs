//! Turns normalized fragments into events and stable response state.
//!
//! Text, thinking, image, citation and safety fragments are emitted the
//! moment they arrive, regardless of how the response finishes. Tool call
//! arguments are collected per call until the vendor signals completion.

use crate::config::StreamLimits;
use crate::error::GatewayError;
use crate::events::{EventEmitter, StreamEvent};
use crate::turn::{ToolCallRecord, ToolCallStatus};
use llm::{ApiError, Citation, ContentBlock, FinishReason, SafetyWarning, StreamFragment, Usage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorState {
    Accumulating,
    /// Arguments parsed into a JSON object
    Ready(serde_json::Value),
    /// Arguments could not be used; the call fails without ending the turn
    Invalid(String),
}

/// Argument buffer of one streamed tool call
#[derive(Debug, Clone)]
pub struct ToolCallAccumulator {
    pub id: String,
    pub name: Option<String>,
    buffer: String,
    state: AccumulatorState,
}

impl ToolCallAccumulator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            buffer: String::new(),
            state: AccumulatorState::Accumulating,
        }
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn raw_arguments(&self) -> &str {
        &self.buffer
    }

    pub fn is_accumulating(&self) -> bool {
        self.state == AccumulatorState::Accumulating
    }

    pub fn status(&self) -> ToolCallStatus {
        match self.state {
            AccumulatorState::Accumulating => ToolCallStatus::Accumulating,
            AccumulatorState::Ready(_) => ToolCallStatus::Ready,
            AccumulatorState::Invalid(_) => ToolCallStatus::Failed,
        }
    }

    /// Snapshot for the turn's tool call list
    pub fn record(&self) -> ToolCallRecord {
        ToolCallRecord {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_default(),
            arguments: self.buffer.clone(),
            status: self.status(),
        }
    }

    /// Append a fragment. Returns false if the call no longer accepts input.
    pub fn push(&mut self, name: Option<String>, fragment: &str) -> bool {
        if !self.is_accumulating() {
            return false;
        }
        if self.name.is_none() {
            self.name = name.filter(|name| !name.is_empty());
        }
        self.buffer.push_str(fragment);
        true
    }

    /// Close the buffer: it must hold a JSON object (or nothing at all)
    pub fn finalize(&mut self) {
        if !self.is_accumulating() {
            return;
        }
        self.state = if self.buffer.trim().is_empty() {
            AccumulatorState::Ready(serde_json::json!({}))
        } else {
            match serde_json::from_str::<serde_json::Value>(&self.buffer) {
                Ok(value) if value.is_object() => AccumulatorState::Ready(value),
                Ok(_) => AccumulatorState::Invalid("arguments are not a JSON object".to_string()),
                Err(e) => AccumulatorState::Invalid(format!("malformed arguments: {e}")),
            }
        };
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_accumulating() {
            self.state = AccumulatorState::Invalid(message.into());
        }
    }
}

/// A tool call whose arguments are final, ready to be executed or rejected
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub arguments: Result<serde_json::Value, String>,
}

/// What one provider response amounted to
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub text: String,
    pub thinking: Option<(String, String)>,
    pub images: Vec<(String, String)>,
    pub tool_calls: Vec<CompletedCall>,
    pub citations: Vec<Citation>,
    pub safety_warnings: Vec<SafetyWarning>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl StreamOutcome {
    /// Assistant message content to append to the history.
    ///
    /// Invalid calls still appear, with empty arguments, so their error
    /// results have a matching call in the history.
    pub fn assistant_content(&self) -> Vec<ContentBlock> {
        let mut content = Vec::new();
        if let Some((thinking, signature)) = &self.thinking {
            content.push(ContentBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        for call in &self.tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call
                    .arguments
                    .clone()
                    .unwrap_or_else(|_| serde_json::json!({})),
            });
        }
        content
    }

    pub fn wants_tools(&self) -> bool {
        self.finish_reason == FinishReason::ToolCalls && !self.tool_calls.is_empty()
    }
}

pub struct StreamingHandler {
    emitter: Arc<EventEmitter>,
    limits: StreamLimits,
    text: String,
    thinking: Option<(String, String)>,
    images: Vec<(String, String)>,
    calls: Vec<ToolCallAccumulator>,
    call_index: HashMap<String, usize>,
    /// Calls created or moved to another status since the last `take_record_updates`
    updated: Vec<usize>,
    /// Payloads dropped because they could not be decoded
    skipped: usize,
    citations: Vec<Citation>,
    safety_warnings: Vec<SafetyWarning>,
    usage: Usage,
    finish_reason: Option<FinishReason>,
}

impl StreamingHandler {
    pub fn new(emitter: Arc<EventEmitter>, limits: StreamLimits) -> Self {
        Self {
            emitter,
            limits,
            text: String::new(),
            thinking: None,
            images: Vec::new(),
            calls: Vec::new(),
            call_index: HashMap::new(),
            updated: Vec::new(),
            skipped: 0,
            citations: Vec::new(),
            safety_warnings: Vec::new(),
            usage: Usage::zero(),
            finish_reason: None,
        }
    }

    /// Process one fragment. Errors end the turn.
    pub fn handle(&mut self, fragment: StreamFragment) -> Result<(), GatewayError> {
        match fragment {
            StreamFragment::Text(delta) => {
                if delta.is_empty() {
                    return Ok(());
                }
                self.check_text_budget(delta.len())?;
                self.text.push_str(&delta);
                self.emitter.emit(StreamEvent::Chunk { content: delta });
            }
            StreamFragment::Thinking(delta) => {
                if delta.is_empty() {
                    return Ok(());
                }
                self.check_text_budget(delta.len())?;
                self.thinking
                    .get_or_insert_with(Default::default)
                    .0
                    .push_str(&delta);
                self.emitter.emit(StreamEvent::Thinking { content: delta });
            }
            StreamFragment::ThinkingSignature(signature) => {
                self.thinking.get_or_insert_with(Default::default).1 = signature;
            }
            StreamFragment::ToolCallDelta {
                id,
                name,
                arguments,
            } => self.handle_tool_delta(id, name, &arguments)?,
            StreamFragment::ToolCallComplete { id } => match self.call_index.get(&id) {
                Some(&index) if self.calls[index].is_accumulating() => {
                    self.calls[index].finalize();
                    self.touch(index);
                }
                Some(_) => debug!("Ignoring repeated completion of tool call {}", id),
                None => warn!("Completion for unknown tool call {}, dropping", id),
            },
            StreamFragment::Image { media_type, data } => {
                self.images.push((media_type.clone(), data.clone()));
                self.emitter.emit(StreamEvent::Image { media_type, data });
            }
            StreamFragment::Grounding(citation) => {
                self.citations.push(citation.clone());
                self.emitter.emit(StreamEvent::Citation { citation });
            }
            StreamFragment::SafetyWarning(warning) => {
                self.safety_warnings.push(warning.clone());
                self.emitter.emit(StreamEvent::SafetyWarning {
                    category: warning.category,
                    detail: warning.detail,
                });
            }
            StreamFragment::Usage(usage) => self.usage.absorb(&usage),
            StreamFragment::Finish(reason) => {
                if let Some(existing) = &self.finish_reason {
                    warn!("Duplicate finish reason {} after {}, dropping", reason, existing);
                    return Ok(());
                }
                if reason == FinishReason::ToolCalls {
                    self.close_calls();
                }
                self.finish_reason = Some(reason);
            }
            StreamFragment::ParseError {
                message,
                tool_call_id,
            } => match tool_call_id.and_then(|id| self.call_index.get(&id).copied()) {
                Some(index) => {
                    warn!("Tool call {} failed to parse: {}", self.calls[index].id, message);
                    self.calls[index].fail(message);
                    self.touch(index);
                }
                None => {
                    warn!("Skipping unparseable stream data: {}", message);
                    self.skipped += 1;
                }
            },
            StreamFragment::ProviderError(message) => {
                return Err(GatewayError::Upstream(ApiError::ServiceError(message)));
            }
        }
        Ok(())
    }

    fn handle_tool_delta(
        &mut self,
        id: String,
        name: Option<String>,
        arguments: &str,
    ) -> Result<(), GatewayError> {
        let limit = self.limits.max_tool_argument_bytes;
        let index = match self.call_index.get(&id) {
            Some(&index) => index,
            None => {
                if self.calls.len() >= self.limits.max_tool_calls {
                    return Err(GatewayError::StreamLimit(format!(
                        "more than {} tool calls in one response",
                        self.limits.max_tool_calls
                    )));
                }
                self.call_index.insert(id.clone(), self.calls.len());
                self.calls.push(ToolCallAccumulator::new(id.clone()));
                self.touch(self.calls.len() - 1);
                self.calls.len() - 1
            }
        };

        let call = &mut self.calls[index];
        if call.raw_arguments().len() + arguments.len() > limit {
            return Err(GatewayError::StreamLimit(format!(
                "arguments of tool call {id} exceed {limit} bytes"
            )));
        }
        let had_name = call.name.is_some();
        if !call.push(name, arguments) {
            warn!("Argument fragment for closed tool call {}, dropping", id);
        } else if !had_name && call.name.is_some() {
            self.touch(index);
        }
        Ok(())
    }

    fn touch(&mut self, index: usize) {
        if !self.updated.contains(&index) {
            self.updated.push(index);
        }
    }

    /// Finalize every call still accumulating. A call that never got a name
    /// cannot be executed and fails here.
    pub fn close_calls(&mut self) {
        for index in 0..self.calls.len() {
            let call = &mut self.calls[index];
            if !call.is_accumulating() {
                continue;
            }
            call.finalize();
            if call.name.is_none() && call.status() == ToolCallStatus::Ready {
                call.state = AccumulatorState::Invalid("tool call without a name".to_string());
            }
            self.touch(index);
        }
    }

    /// Records of calls that appeared or changed status since the last call
    pub fn take_record_updates(&mut self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut self.updated)
            .into_iter()
            .map(|index| self.calls[index].record())
            .collect()
    }

    /// Fails when the response cannot be interpreted: it ended without a
    /// finish reason after payloads had to be dropped.
    pub fn check_complete(&self) -> Result<(), GatewayError> {
        if self.finish_reason.is_none() && self.skipped > 0 {
            return Err(GatewayError::StreamParse(format!(
                "response ended without a finish reason after {} undecodable payloads",
                self.skipped
            )));
        }
        Ok(())
    }

    fn check_text_budget(&self, additional: usize) -> Result<(), GatewayError> {
        let used = self.text.len()
            + self
                .thinking
                .as_ref()
                .map(|(thinking, _)| thinking.len())
                .unwrap_or(0);
        if used + additional > self.limits.max_text_bytes {
            return Err(GatewayError::StreamLimit(format!(
                "response text exceeds {} bytes",
                self.limits.max_text_bytes
            )));
        }
        Ok(())
    }

    /// Close the response. Calls the vendor never completed are closed now.
    pub fn finish(mut self) -> StreamOutcome {
        self.close_calls();
        let tool_calls = self
            .calls
            .iter()
            .map(|call| {
                let name = call.name.clone().unwrap_or_default();
                let arguments = match call.state() {
                    AccumulatorState::Ready(value) => Ok(value.clone()),
                    AccumulatorState::Invalid(message) => Err(message.clone()),
                    AccumulatorState::Accumulating => Err("arguments never completed".to_string()),
                };
                CompletedCall {
                    id: call.id.clone(),
                    name,
                    raw_arguments: call.raw_arguments().to_string(),
                    arguments,
                }
            })
            .collect();

        StreamOutcome {
            text: self.text,
            thinking: self.thinking,
            images: self.images,
            tool_calls,
            citations: self.citations,
            safety_warnings: self.safety_warnings,
            finish_reason: self.finish_reason.unwrap_or_default(),
            usage: self.usage,
        }
    }
}
