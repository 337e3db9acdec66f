use crate::throttle::ThrottleKey;
use llm::ApiError;
use std::time::Duration;

/// Everything that can go wrong in a turn.
///
/// All variants end the turn except `ToolExecution`, which the tool loop
/// turns into a failed tool result for the model to react to.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("No model available: {0}")]
    NoModelAvailable(String),

    #[error(transparent)]
    Upstream(#[from] ApiError),

    #[error("Stream parse error: {0}")]
    StreamParse(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Timed out after {timeout:?} waiting for a {key} slot")]
    ThrottleTimeout { key: ThrottleKey, timeout: Duration },

    #[error("Tool loop exceeded the limit of {0} iterations")]
    ToolLoopExceeded(u32),

    #[error("Stream limit exceeded: {0}")]
    StreamLimit(String),

    #[error("Turn exceeded its time limit of {0:?}")]
    TurnTimeout(Duration),

    #[error("Turn was cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Stable machine-readable code carried by `error` events
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NoModelAvailable(_) => "no_model_available",
            GatewayError::Upstream(error) => match error {
                ApiError::RateLimit(_) => "rate_limited",
                ApiError::Authentication(_) => "authentication_failed",
                ApiError::InvalidRequest(_) => "invalid_request",
                ApiError::Overloaded(_) | ApiError::NetworkError(_) => "upstream_unavailable",
                ApiError::Decode(_) => "stream_parse_error",
                ApiError::ServiceError(_) | ApiError::Unknown(_) => "upstream_error",
            },
            GatewayError::StreamParse(_) => "stream_parse_error",
            GatewayError::ToolExecution(_) => "tool_execution_error",
            GatewayError::ThrottleTimeout { .. } => "throttle_timeout",
            GatewayError::ToolLoopExceeded(_) => "tool_loop_exceeded",
            GatewayError::StreamLimit(_) => "stream_limit_exceeded",
            GatewayError::TurnTimeout(_) => "turn_timeout",
            GatewayError::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }
}
