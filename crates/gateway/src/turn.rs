use chrono::{DateTime, Utc};
use llm::{Message, Usage};
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Building,
    Streaming,
    AwaitingTools,
    Done,
    Error,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Building => "building",
            TurnStatus::Streaming => "streaming",
            TurnStatus::AwaitingTools => "awaiting-tools",
            TurnStatus::Done => "done",
            TurnStatus::Error => "error",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TurnStatus::Done | TurnStatus::Error | TurnStatus::Cancelled
        )
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Accumulating → Ready → Executing → Completed`, with `Failed` reachable
/// from every state before `Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Accumulating,
    Ready,
    Executing,
    Completed,
    Failed,
}

/// A tool call as tracked over the lifetime of a turn, from its first
/// streamed fragment on
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Raw argument buffer as of the last status change
    pub arguments: String,
    pub status: ToolCallStatus,
}

/// One user message through completion of all model and tool interaction
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub id: String,
    pub model_id: String,
    /// Append-only history; resubmitted in full on every iteration
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub status: TurnStatus,
    pub usage: Usage,
    /// Completed tool rounds
    pub iterations: u32,
    pub started_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            messages,
            tool_calls: Vec::new(),
            status: TurnStatus::Building,
            usage: Usage::zero(),
            iterations: 0,
            started_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: TurnStatus) {
        if self.status == status {
            return;
        }
        debug!("Turn {}: {} -> {}", self.id, self.status, status);
        self.status = status;
    }

    /// Insert a new record or replace the one with the same id
    pub fn track_tool_call(&mut self, record: ToolCallRecord) {
        match self.tool_calls.iter_mut().find(|known| known.id == record.id) {
            Some(known) => *known = record,
            None => self.tool_calls.push(record),
        }
    }

    pub fn set_tool_status(&mut self, id: &str, status: ToolCallStatus) {
        if let Some(record) = self.tool_calls.iter_mut().find(|record| record.id == id) {
            trace!("Tool call {}: {:?} -> {:?}", id, record.status, status);
            record.status = status;
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}
