//! Entry point for chat turns.
//!
//! The orchestrator resolves the model, snapshots the configuration, and
//! hands the turn to a `ToolExecutor`. Streaming callers get a `TurnHandle`
//! yielding events as they happen; buffered callers get one
//! `ChatCompletion` folded from the same events.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::{EventEmitter, EventEnvelope, StreamEvent};
use crate::executor::{ModelTarget, ToolExecutor, TurnInput, TurnServices, TurnSettings};
use crate::throttle::RequestThrottler;
use crate::tools::ToolSet;
use crate::turn::ChatTurn;
use futures::Stream;
use llm::{
    AdapterRegistry, ChatOptions, Citation, FinishReason, HttpTransport, Message, SafetyWarning,
    Transport, Usage,
};
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A fully resolved chat request
#[derive(Clone)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub tools: ToolSet,
    pub options: ChatOptions,
    /// Deliver events incrementally instead of one final response
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            system_prompt: String::new(),
            tools: ToolSet::new(),
            options: ChatOptions::default(),
            stream: true,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Live event stream of a running turn. Dropping it cancels the turn.
pub struct TurnHandle {
    turn_id: String,
    events: mpsc::UnboundedReceiver<EventEnvelope>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl TurnHandle {
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Request cancellation. The stream still ends with a terminal event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<EventEnvelope> {
        self.events.recv().await
    }
}

impl Stream for TurnHandle {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedImage {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallSummary {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The buffered form of a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatCompletion {
    pub turn_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    pub images: Vec<GeneratedImage>,
    pub tool_calls: Vec<ToolCallSummary>,
    pub citations: Vec<Citation>,
    pub safety_warnings: Vec<SafetyWarning>,
    pub finish_reason: String,
    pub usage: Usage,
}

impl ChatCompletion {
    pub fn from_events(
        turn_id: impl Into<String>,
        events: impl IntoIterator<Item = EventEnvelope>,
    ) -> Self {
        let mut completion = ChatCompletion {
            turn_id: turn_id.into(),
            ..Default::default()
        };
        for envelope in events {
            match envelope.event {
                StreamEvent::Chunk { content } => completion.text.push_str(&content),
                StreamEvent::Thinking { content } => completion.thinking.push_str(&content),
                StreamEvent::Image { media_type, data } => completion
                    .images
                    .push(GeneratedImage { media_type, data }),
                StreamEvent::ToolCallStart {
                    call_id,
                    name,
                    arguments,
                } => completion.tool_calls.push(ToolCallSummary {
                    call_id,
                    name,
                    arguments,
                    result: None,
                    error: None,
                }),
                StreamEvent::ToolCallEnd {
                    call_id,
                    result,
                    error,
                } => {
                    if let Some(call) = completion
                        .tool_calls
                        .iter_mut()
                        .find(|call| call.call_id == call_id)
                    {
                        call.result = result;
                        call.error = error;
                    }
                }
                StreamEvent::Citation { citation } => completion.citations.push(citation),
                StreamEvent::SafetyWarning { category, detail } => completion
                    .safety_warnings
                    .push(SafetyWarning { category, detail }),
                StreamEvent::SessionEnd { usage } => completion.usage = usage,
                StreamEvent::Done { finish_reason } => completion.finish_reason = finish_reason,
                StreamEvent::Connected
                | StreamEvent::SessionStart { .. }
                | StreamEvent::ToolCallProgress { .. }
                | StreamEvent::Error { .. } => {}
            }
        }
        completion
    }
}

pub enum ChatReply {
    Stream(TurnHandle),
    Complete(ChatCompletion),
}

pub struct ChatOrchestrator {
    config: RwLock<Arc<GatewayConfig>>,
    registry: AdapterRegistry,
    services: TurnServices,
}

impl ChatOrchestrator {
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> Self {
        let throttler = Arc::new(RequestThrottler::new(config.throttle.clone()));
        Self {
            config: RwLock::new(Arc::new(config)),
            registry: AdapterRegistry::new(),
            services: TurnServices {
                transport,
                throttler,
            },
        }
    }

    /// Build an orchestrator talking to real provider endpoints
    pub fn from_config(config: GatewayConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(config.max_retries));
        Self::new(config, transport)
    }

    /// Swap the configuration. Running turns keep their snapshot; throttle
    /// limits apply from the next acquisition on.
    pub fn update_config(&self, config: GatewayConfig) {
        self.services.throttler.update_config(config.throttle.clone());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn throttler(&self) -> &Arc<RequestThrottler> {
        &self.services.throttler
    }

    /// Dispatch on the request's streaming preference
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatReply, GatewayError> {
        if request.stream {
            Ok(ChatReply::Stream(self.stream(request)))
        } else {
            self.complete(request).await.map(ChatReply::Complete)
        }
    }

    /// Start a turn in the background and return its live event stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self, request: ChatRequest) -> TurnHandle {
        let cancel = CancellationToken::new();
        let (emitter, events) = self.open_turn(cancel.clone());
        let turn_id = emitter.turn_id().to_string();
        let prepared = self.prepare(request, emitter.clone(), cancel.clone(), true);
        tokio::spawn(drive_turn(prepared, emitter));

        TurnHandle {
            turn_id,
            events,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// Run a turn to completion over the vendors' non-streaming endpoints
    pub async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, GatewayError> {
        let cancel = CancellationToken::new();
        let (emitter, mut events) = self.open_turn(cancel.clone());
        let turn_id = emitter.turn_id().to_string();
        let prepared = self.prepare(request, emitter.clone(), cancel, false);
        let result = drive_turn(prepared, emitter).await;

        let buffered = std::iter::from_fn(|| events.try_recv().ok());
        let completion = ChatCompletion::from_events(turn_id, buffered);
        result.map(|_| completion)
    }

    fn open_turn(
        &self,
        cancel: CancellationToken,
    ) -> (Arc<EventEmitter>, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (emitter, events) = EventEmitter::channel(Uuid::new_v4().to_string(), cancel);
        emitter.emit(StreamEvent::Connected);
        (Arc::new(emitter), events)
    }

    fn prepare(
        &self,
        request: ChatRequest,
        emitter: Arc<EventEmitter>,
        cancel: CancellationToken,
        streaming: bool,
    ) -> Result<PreparedTurn, GatewayError> {
        let config = self.config();
        let model = config
            .models
            .get(&request.model_id)
            .cloned()
            .ok_or_else(|| GatewayError::NoModelAvailable(request.model_id.clone()))?;
        let provider = self.registry.get(model.provider);
        debug!(
            "Turn {}: model {} via {:?} ({})",
            emitter.turn_id(),
            request.model_id,
            model.provider,
            model.model
        );

        let turn = ChatTurn::new(emitter.turn_id(), request.model_id, request.messages);
        let executor = ToolExecutor::new(
            turn,
            ModelTarget {
                config: model,
                provider,
            },
            self.services.clone(),
            TurnInput {
                system_prompt: request.system_prompt,
                options: request.options,
                tools: request.tools,
            },
            emitter,
            cancel,
            TurnSettings::from_config(&config, streaming),
        );
        Ok(PreparedTurn {
            executor,
            turn_timeout: config.turn_timeout(),
        })
    }
}

struct PreparedTurn {
    executor: ToolExecutor,
    turn_timeout: Option<Duration>,
}

async fn drive_turn(
    prepared: Result<PreparedTurn, GatewayError>,
    emitter: Arc<EventEmitter>,
) -> Result<FinishReason, GatewayError> {
    let PreparedTurn {
        mut executor,
        turn_timeout,
    } = match prepared {
        Ok(prepared) => prepared,
        Err(error) => {
            warn!("Turn {} rejected: {}", emitter.turn_id(), error);
            let result = Err(error);
            emitter.finish(&result);
            return result;
        }
    };

    emitter.emit(StreamEvent::SessionStart {
        model: executor.turn().model_id.clone(),
    });

    let result = match turn_timeout {
        Some(limit) => tokio::time::timeout(limit, executor.run())
            .await
            .unwrap_or(Err(GatewayError::TurnTimeout(limit))),
        None => executor.run().await,
    };
    executor.conclude(&result);

    let turn = executor.turn();
    match &result {
        Ok(reason) => debug!(
            "Turn {} finished with {} after {} tool rounds in {}ms",
            turn.id,
            reason,
            turn.iterations,
            turn.elapsed().num_milliseconds()
        ),
        Err(GatewayError::Cancelled) => info!("Turn {} cancelled", turn.id),
        Err(error) => warn!("Turn {} failed [{}]: {}", turn.id, error.code(), error),
    }

    emitter.finish(&result);
    result
}
