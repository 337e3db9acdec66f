use crate::events::{EventEmitter, StreamEvent};
use anyhow::Result;
use async_trait::async_trait;
use llm::ToolDefinition;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a running tool can see of its turn
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub tool_name: String,
    emitter: Arc<EventEmitter>,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        emitter: Arc<EventEmitter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            emitter,
            cancel,
        }
    }

    /// Report progress of a long running call as `tool.call.progress`
    pub fn progress(&self, status: impl Into<String>) {
        self.emitter.emit(StreamEvent::ToolCallProgress {
            call_id: self.call_id.clone(),
            status: status.into(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the turn is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Executes one tool given its parsed arguments.
///
/// An `Err` is not fatal to the turn: its message becomes the tool result
/// the model sees, flagged as an error.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, context: ToolContext, arguments: serde_json::Value) -> Result<String>;
}

/// Adapts an async closure to `ToolHandler`
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(ToolContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn call(&self, context: ToolContext, arguments: serde_json::Value) -> Result<String> {
        (self.0)(context, arguments).await
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    /// Throttle key, defaults to the tool name
    pub throttle_id: String,
    /// Overrides the turn's tool timeout
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn ToolHandler>,
}

impl RegisteredTool {
    pub fn new(definition: ToolDefinition, handler: impl ToolHandler + 'static) -> Self {
        Self {
            throttle_id: definition.name.clone(),
            definition,
            timeout: None,
            handler: Arc::new(handler),
        }
    }

    pub fn from_fn<F, Fut>(definition: ToolDefinition, f: F) -> Self
    where
        F: Fn(ToolContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self::new(definition, FnTool(f))
    }

    pub fn with_throttle_id(mut self, throttle_id: impl Into<String>) -> Self {
        self.throttle_id = throttle_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// The resolved tools a turn may call, in declaration order
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<RegisteredTool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing an earlier one with the same name
    pub fn register(&mut self, tool: RegisteredTool) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn with_tool(mut self, tool: RegisteredTool) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}
