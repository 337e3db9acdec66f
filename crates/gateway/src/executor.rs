//! The tool-calling loop of one turn.
//!
//! `Sending → Streaming → EvaluatingFinish → (ExecutingTools → Sending) |
//! Done | Error | Cancelled`. Every suspension point races against the
//! turn's cancellation token, and every throttle permit is owned by a guard,
//! so leaving the loop by any path gives all slots back.

use crate::config::{GatewayConfig, StreamLimits};
use crate::error::GatewayError;
use crate::events::{EventEmitter, StreamEvent};
use crate::stream_handler::{CompletedCall, StreamOutcome, StreamingHandler};
use crate::throttle::{RequestThrottler, ThrottleKey, ThrottlePermit};
use crate::tools::{RegisteredTool, ToolContext, ToolSet};
use crate::turn::{ChatTurn, ToolCallStatus, TurnStatus};
use futures::future::try_join_all;
use llm::{
    ApiError, ChatOptions, ContentBlock, DecodeState, FinishReason, LLMRequest, Message,
    ModelConfig, Provider, ProviderAdapter, SseDecoder, StreamFragment, Transport, WireRequest,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Sending,
    Streaming,
    EvaluatingFinish,
    ExecutingTools,
    Done,
    Error,
    Cancelled,
}

impl ExecutorState {
    fn turn_status(&self) -> TurnStatus {
        match self {
            ExecutorState::Sending | ExecutorState::Streaming | ExecutorState::EvaluatingFinish => {
                TurnStatus::Streaming
            }
            ExecutorState::ExecutingTools => TurnStatus::AwaitingTools,
            ExecutorState::Done => TurnStatus::Done,
            ExecutorState::Error => TurnStatus::Error,
            ExecutorState::Cancelled => TurnStatus::Cancelled,
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-turn snapshot of the limits and timeouts in effect
#[derive(Debug, Clone, Copy)]
pub struct TurnSettings {
    pub limits: StreamLimits,
    pub max_tool_iterations: u32,
    pub tool_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Use the vendor's streaming endpoint
    pub streaming: bool,
}

impl TurnSettings {
    pub fn from_config(config: &GatewayConfig, streaming: bool) -> Self {
        Self {
            limits: config.limits,
            max_tool_iterations: config.max_tool_iterations,
            tool_timeout: config.tool_timeout(),
            acquire_timeout: config.throttle.acquire_timeout(),
            streaming,
        }
    }
}

/// Shared infrastructure a turn calls out through
#[derive(Clone)]
pub struct TurnServices {
    pub transport: Arc<dyn Transport>,
    pub throttler: Arc<RequestThrottler>,
}

/// The resolved model a turn talks to
#[derive(Debug, Clone)]
pub struct ModelTarget {
    pub config: ModelConfig,
    pub provider: Arc<Provider>,
}

/// What the caller asked for, besides the history
#[derive(Clone, Default)]
pub struct TurnInput {
    pub system_prompt: String,
    pub options: ChatOptions,
    pub tools: ToolSet,
}

pub struct ToolExecutor {
    turn: ChatTurn,
    target: ModelTarget,
    services: TurnServices,
    input: TurnInput,
    emitter: Arc<EventEmitter>,
    cancel: CancellationToken,
    settings: TurnSettings,
    state: ExecutorState,
}

impl ToolExecutor {
    pub fn new(
        turn: ChatTurn,
        target: ModelTarget,
        services: TurnServices,
        input: TurnInput,
        emitter: Arc<EventEmitter>,
        cancel: CancellationToken,
        settings: TurnSettings,
    ) -> Self {
        Self {
            turn,
            target,
            services,
            input,
            emitter,
            cancel,
            settings,
            state: ExecutorState::Sending,
        }
    }

    pub fn turn(&self) -> &ChatTurn {
        &self.turn
    }

    pub fn into_turn(self) -> ChatTurn {
        self.turn
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Drive the loop until the model stops asking for tools.
    ///
    /// The terminal state is recorded by `conclude`, which the caller invokes
    /// even when this future was abandoned (turn timeout).
    pub async fn run(&mut self) -> Result<FinishReason, GatewayError> {
        loop {
            self.transition(ExecutorState::Sending);
            let request = self.build_request();
            let wire = self
                .target
                .provider
                .create_request(&self.target.config, &request, self.settings.streaming)?;

            let mut permit = self
                .acquire(ThrottleKey::Model(self.turn.model_id.clone()))
                .await?;
            self.transition(ExecutorState::Streaming);
            let outcome = self.receive(&request, &wire).await;
            permit.release();
            let outcome = outcome?;

            self.turn.usage.add(&outcome.usage);
            let content = outcome.assistant_content();
            if !content.is_empty() {
                self.turn.messages.push(Message::assistant(content));
            }

            self.transition(ExecutorState::EvaluatingFinish);
            if !outcome.wants_tools() {
                if !outcome.tool_calls.is_empty() {
                    warn!(
                        "Turn {}: ignoring {} tool calls, finish reason is {}",
                        self.turn.id,
                        outcome.tool_calls.len(),
                        outcome.finish_reason
                    );
                    for call in &outcome.tool_calls {
                        self.turn.set_tool_status(&call.id, ToolCallStatus::Failed);
                    }
                }
                self.emitter.emit(StreamEvent::SessionEnd {
                    usage: self.turn.usage,
                });
                return Ok(outcome.finish_reason);
            }

            if self.turn.iterations >= self.settings.max_tool_iterations {
                return Err(GatewayError::ToolLoopExceeded(
                    self.settings.max_tool_iterations,
                ));
            }

            self.transition(ExecutorState::ExecutingTools);
            let results = self.execute_tools(&outcome).await?;
            self.turn.iterations += 1;
            self.turn.messages.push(Message::tool_results(results));
        }
    }

    /// Record how the turn ended
    pub fn conclude(&mut self, result: &Result<FinishReason, GatewayError>) {
        let state = match result {
            Ok(_) => ExecutorState::Done,
            Err(GatewayError::Cancelled) => ExecutorState::Cancelled,
            Err(_) => ExecutorState::Error,
        };
        self.transition(state);
    }

    fn transition(&mut self, state: ExecutorState) {
        if self.state != state {
            trace!("Turn {}: {} -> {}", self.turn.id, self.state, state);
            self.state = state;
        }
        self.turn.set_status(state.turn_status());
    }

    fn build_request(&self) -> LLMRequest {
        LLMRequest {
            messages: self.turn.messages.clone(),
            system_prompt: self.input.system_prompt.clone(),
            tools: (!self.input.tools.is_empty()).then(|| self.input.tools.definitions()),
            options: self.input.options.clone(),
            request_id: u64::from(self.turn.iterations) + 1,
        }
    }

    /// Await `future` unless the turn is cancelled first
    async fn cancellable<F: Future>(&self, future: F) -> Result<F::Output, GatewayError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            output = future => Ok(output),
        }
    }

    async fn acquire(&self, key: ThrottleKey) -> Result<ThrottlePermit, GatewayError> {
        self.cancellable(
            self.services
                .throttler
                .acquire(&key, self.settings.acquire_timeout),
        )
        .await?
    }

    async fn receive(
        &mut self,
        request: &LLMRequest,
        wire: &WireRequest,
    ) -> Result<StreamOutcome, GatewayError> {
        let mut handler = StreamingHandler::new(self.emitter.clone(), self.settings.limits);
        let mut state = DecodeState::for_request(request);
        let provider = self.target.provider.clone();

        if wire.streaming {
            let mut stream = self
                .cancellable(self.services.transport.open_stream(wire))
                .await??;
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = self.cancellable(stream.next_chunk()).await?? {
                for data in decoder.feed(&chunk) {
                    trace!("Turn {}: stream data {}", self.turn.id, data);
                    for fragment in provider.parse_stream_chunk(&mut state, &data) {
                        self.feed(&mut handler, fragment)?;
                    }
                }
            }
            for data in decoder.finish() {
                for fragment in provider.parse_stream_chunk(&mut state, &data) {
                    self.feed(&mut handler, fragment)?;
                }
            }
            handler.check_complete()?;
        } else {
            let body = self
                .cancellable(self.services.transport.send(wire))
                .await??;
            let response = provider
                .parse_response(&mut state, &body)
                .map_err(|error| match error {
                    ApiError::Decode(message) => GatewayError::StreamParse(message),
                    other => GatewayError::Upstream(other),
                })?;
            for fragment in response.into_fragments() {
                self.feed(&mut handler, fragment)?;
            }
        }

        handler.close_calls();
        self.sync_tool_calls(&mut handler);
        Ok(handler.finish())
    }

    fn feed(
        &mut self,
        handler: &mut StreamingHandler,
        fragment: StreamFragment,
    ) -> Result<(), GatewayError> {
        handler.handle(fragment)?;
        self.sync_tool_calls(handler);
        Ok(())
    }

    fn sync_tool_calls(&mut self, handler: &mut StreamingHandler) {
        for record in handler.take_record_updates() {
            trace!(
                "Turn {}: tool call {} ({}) is {:?}",
                self.turn.id,
                record.id,
                record.name,
                record.status
            );
            self.turn.track_tool_call(record);
        }
    }

    /// Run every call of one round concurrently and collect their results
    /// in call order. Only cancellation or a throttle timeout fails here.
    async fn execute_tools(
        &mut self,
        outcome: &StreamOutcome,
    ) -> Result<Vec<ContentBlock>, GatewayError> {
        for call in outcome.tool_calls.iter().filter(|call| call.arguments.is_ok()) {
            self.turn.set_tool_status(&call.id, ToolCallStatus::Executing);
        }

        let this: &Self = self;
        let results =
            try_join_all(outcome.tool_calls.iter().map(|call| this.execute_tool(call))).await?;

        for result in &results {
            if let ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } = result
            {
                let status = if *is_error {
                    ToolCallStatus::Failed
                } else {
                    ToolCallStatus::Completed
                };
                self.turn.set_tool_status(tool_use_id, status);
            }
        }
        Ok(results)
    }

    /// `ToolExecution` errors become a failed tool result for the model;
    /// any other error ends the turn.
    async fn execute_tool(&self, call: &CompletedCall) -> Result<ContentBlock, GatewayError> {
        let arguments = match &call.arguments {
            Ok(arguments) => arguments.clone(),
            Err(_) => serde_json::Value::String(call.raw_arguments.clone()),
        };
        self.emitter.emit(StreamEvent::ToolCallStart {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        });

        let outcome = match (&call.arguments, self.input.tools.get(&call.name)) {
            (Err(message), _) => Err(GatewayError::ToolExecution(format!(
                "Invalid arguments for tool '{}': {}",
                call.name, message
            ))),
            (Ok(_), None) => Err(GatewayError::ToolExecution(format!(
                "Unknown tool '{}'",
                call.name
            ))),
            (Ok(arguments), Some(tool)) => self.run_tool(call, tool, arguments.clone()).await,
        };

        let (content, is_error) = match outcome {
            Ok(output) => {
                debug!("Tool call {} ({}) completed", call.id, call.name);
                self.emitter.emit(StreamEvent::ToolCallEnd {
                    call_id: call.id.clone(),
                    result: Some(output.clone()),
                    error: None,
                });
                (output, false)
            }
            Err(GatewayError::ToolExecution(message)) => {
                warn!("Tool call {} ({}) failed: {}", call.id, call.name, message);
                self.emitter.emit(StreamEvent::ToolCallEnd {
                    call_id: call.id.clone(),
                    result: None,
                    error: Some(message.clone()),
                });
                (message, true)
            }
            Err(error) => return Err(error),
        };

        Ok(ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            is_error,
        })
    }

    async fn run_tool(
        &self,
        call: &CompletedCall,
        tool: &RegisteredTool,
        arguments: serde_json::Value,
    ) -> Result<String, GatewayError> {
        let mut permit = self
            .acquire(ThrottleKey::Tool(tool.throttle_id.clone()))
            .await?;
        let timeout = tool.timeout.unwrap_or(self.settings.tool_timeout);
        let context = ToolContext::new(
            call.id.as_str(),
            call.name.as_str(),
            self.emitter.clone(),
            self.cancel.child_token(),
        );

        let result = self
            .cancellable(tokio::time::timeout(
                timeout,
                tool.handler.call(context, arguments),
            ))
            .await?;
        permit.release();

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(GatewayError::ToolExecution(format!("{e:#}"))),
            Err(_) => Err(GatewayError::ToolExecution(format!(
                "Tool '{}' timed out after {:?}",
                call.name, timeout
            ))),
        }
    }
}
