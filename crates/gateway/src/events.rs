//! The provider-independent event protocol.
//!
//! A turn produces exactly one ordered stream of `EventEnvelope`s. The
//! emitter numbers them without gaps and closes the stream with exactly one
//! terminal event (`done` or `error`), whichever path ends the turn.

use crate::error::GatewayError;
use llm::{Citation, FinishReason, Usage};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Finish reason reported when a turn was cancelled. Not a failure.
pub const CANCELLED_FINISH_REASON: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "session.start")]
    SessionStart { model: String },

    /// Incremental assistant text
    #[serde(rename = "chunk")]
    Chunk { content: String },

    #[serde(rename = "thinking")]
    Thinking { content: String },

    #[serde(rename = "image")]
    Image { media_type: String, data: String },

    #[serde(rename = "tool.call.start")]
    ToolCallStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "tool.call.progress")]
    ToolCallProgress { call_id: String, status: String },

    #[serde(rename = "tool.call.end")]
    ToolCallEnd {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "citation")]
    Citation {
        #[serde(flatten)]
        citation: Citation,
    },

    #[serde(rename = "safety.warning")]
    SafetyWarning { category: String, detail: String },

    #[serde(rename = "session.end")]
    SessionEnd { usage: Usage },

    #[serde(rename = "done")]
    Done { finish_reason: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Connected => "connected",
            StreamEvent::SessionStart { .. } => "session.start",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::Image { .. } => "image",
            StreamEvent::ToolCallStart { .. } => "tool.call.start",
            StreamEvent::ToolCallProgress { .. } => "tool.call.progress",
            StreamEvent::ToolCallEnd { .. } => "tool.call.end",
            StreamEvent::Citation { .. } => "citation",
            StreamEvent::SafetyWarning { .. } => "safety.warning",
            StreamEvent::SessionEnd { .. } => "session.end",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    pub fn error(error: &GatewayError) -> Self {
        StreamEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// An event stamped with its turn and position in the turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub turn_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl EventEnvelope {
    /// Render as one server-sent events frame
    pub fn to_sse(&self) -> serde_json::Result<String> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.event.event_type(),
            serde_json::to_string(self)?
        ))
    }
}

struct EmitterState {
    next_seq: u64,
    terminated: bool,
}

/// Single producer of a turn's events.
///
/// Shared between the turn driver and running tools (progress reports), so
/// numbering and sending happen under one lock.
pub struct EventEmitter {
    turn_id: String,
    state: Mutex<EmitterState>,
    sender: mpsc::UnboundedSender<EventEnvelope>,
    /// Cancelled when nobody is listening anymore
    cancel: CancellationToken,
}

impl EventEmitter {
    pub fn new(
        turn_id: impl Into<String>,
        sender: mpsc::UnboundedSender<EventEnvelope>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            turn_id: turn_id.into(),
            state: Mutex::new(EmitterState {
                next_seq: 1,
                terminated: false,
            }),
            sender,
            cancel,
        }
    }

    pub fn channel(
        turn_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(turn_id, sender, cancel), receiver)
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Send an event. Returns false if it was dropped, either because the
    /// turn already ended or because the consumer went away.
    pub fn emit(&self, event: StreamEvent) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.terminated {
            debug!(
                "Turn {}: dropping {} after terminal event",
                self.turn_id,
                event.event_type()
            );
            return false;
        }
        if event.is_terminal() {
            state.terminated = true;
        }

        let envelope = EventEnvelope {
            turn_id: self.turn_id.clone(),
            seq: state.next_seq,
            event,
        };
        trace!(
            "Turn {}: emitting #{} {}",
            self.turn_id,
            envelope.seq,
            envelope.event.event_type()
        );
        if self.sender.send(envelope).is_err() {
            debug!("Turn {}: event consumer is gone, cancelling", self.turn_id);
            state.terminated = true;
            self.cancel.cancel();
            return false;
        }
        state.next_seq += 1;
        true
    }

    /// Emit the terminal event for a turn result
    pub fn finish(&self, result: &Result<FinishReason, GatewayError>) -> bool {
        let event = match result {
            Ok(reason) => StreamEvent::Done {
                finish_reason: reason.to_string(),
            },
            Err(GatewayError::Cancelled) => StreamEvent::Done {
                finish_reason: CANCELLED_FINISH_REASON.to_string(),
            },
            Err(error) => StreamEvent::error(error),
        };
        self.emit(event)
    }

    pub fn is_terminated(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk {
            content: text.to_string(),
        }
    }

    #[test]
    fn test_sequence_numbers_start_at_one_without_gaps() {
        let (emitter, mut rx) = EventEmitter::channel("turn-1", CancellationToken::new());
        assert!(emitter.emit(StreamEvent::Connected));
        assert!(emitter.emit(chunk("a")));
        assert!(emitter.emit(chunk("b")));

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|envelope| envelope.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let (emitter, mut rx) = EventEmitter::channel("turn-1", CancellationToken::new());
        assert!(emitter.finish(&Ok(FinishReason::Stop)));
        assert!(!emitter.finish(&Err(GatewayError::ToolLoopExceeded(3))));
        assert!(!emitter.emit(chunk("late")));
        assert!(emitter.is_terminated());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            StreamEvent::Done {
                finish_reason: "stop".into()
            }
        );
    }

    #[test]
    fn test_cancellation_is_done_not_error() {
        let (emitter, mut rx) = EventEmitter::channel("turn-1", CancellationToken::new());
        emitter.finish(&Err(GatewayError::Cancelled));
        assert_eq!(
            rx.try_recv().unwrap().event,
            StreamEvent::Done {
                finish_reason: CANCELLED_FINISH_REASON.into()
            }
        );
    }

    #[test]
    fn test_dropped_consumer_cancels_turn() {
        let cancel = CancellationToken::new();
        let (emitter, rx) = EventEmitter::channel("turn-1", cancel.clone());
        drop(rx);
        assert!(!emitter.emit(chunk("nobody listens")));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = EventEnvelope {
            turn_id: "t1".into(),
            seq: 4,
            event: StreamEvent::ToolCallStart {
                call_id: "call_1".into(),
                name: "lookup".into(),
                arguments: json!({"id": 42}),
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "turn_id": "t1",
                "seq": 4,
                "type": "tool.call.start",
                "call_id": "call_1",
                "name": "lookup",
                "arguments": {"id": 42}
            })
        );

        let sse = envelope.to_sse().unwrap();
        assert!(sse.starts_with("event: tool.call.start\ndata: {"));
        assert!(sse.ends_with("}\n\n"));
    }

    #[test]
    fn test_citation_and_error_payloads() {
        let citation = StreamEvent::Citation {
            citation: Citation {
                url: Some("https://example.com".into()),
                start: Some(0),
                end: Some(4),
                ..Default::default()
            },
        };
        assert_eq!(
            serde_json::to_value(&citation).unwrap(),
            json!({"type": "citation", "url": "https://example.com", "start": 0, "end": 4})
        );

        let error = StreamEvent::error(&GatewayError::NoModelAvailable("m".into()));
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "code": "no_model_available", "message": "No model available: m"})
        );
    }
}
