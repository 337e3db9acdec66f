use crate::{ApiError, ApiErrorContext};
use rand::Rng;
use reqwest::{Response, StatusCode};
use std::time::Duration;

/// Upper bound for a server supplied retry hint
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Check response status and map failures to `ApiError`.
/// Returns Ok(Response) if successful, or the error with the server's
/// retry hint if not.
pub async fn check_response_error(response: Response) -> Result<Response, ApiErrorContext> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;

    Err(ApiErrorContext {
        error: error_for_status(status, response_text),
        retry_after,
    })
}

pub fn error_for_status(status: StatusCode, response_text: String) -> ApiError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(response_text),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Authentication(response_text)
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ApiError::InvalidRequest(response_text)
        }
        // Anthropic's overloaded status
        status if status.as_u16() == 529 => ApiError::Overloaded(response_text),
        StatusCode::SERVICE_UNAVAILABLE => ApiError::Overloaded(response_text),
        status if status.is_server_error() => ApiError::ServiceError(response_text),
        _ => ApiError::Unknown(format!("Status {status}: {response_text}")),
    }
}

/// Parse a `retry-after` header given in seconds
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER))
}

/// Delay before retry number `attempts` (1-based): the server hint when
/// present, otherwise exponential backoff with a little jitter.
pub fn retry_delay(attempts: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(delay) = retry_after {
        return delay;
    }
    let base = Duration::from_secs(2u64.pow(attempts.saturating_sub(1).min(6)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}
