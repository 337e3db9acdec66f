//! Outbound HTTP for wire requests.
//!
//! Retries cover only the phase before any response body byte has been
//! consumed. A stream that fails halfway is surfaced to the caller, since
//! fragments may already have been delivered downstream.

use crate::adapter::WireRequest;
use crate::streaming::{ChunkStream, HttpChunkStream};
use crate::{utils, ApiError, ApiErrorContext};
use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a non-streaming request and return the full response body
    async fn send(&self, request: &WireRequest) -> Result<String, ApiError>;

    /// Send a streaming request and return the raw chunk source
    async fn open_stream(&self, request: &WireRequest) -> Result<Box<dyn ChunkStream>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(max_retries: u32) -> Self {
        Self {
            client: Client::new(),
            max_retries,
        }
    }

    pub fn with_client(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
        }
    }

    async fn try_send(&self, request: &WireRequest) -> Result<Response, ApiErrorContext> {
        let mut request_builder = self.client.post(&request.url);
        for (key, value) in &request.headers {
            request_builder = request_builder.header(key, value);
        }

        let response = request_builder
            .json(&request.body)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        utils::check_response_error(response).await
    }

    async fn send_with_retry(&self, request: &WireRequest) -> Result<Response, ApiError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.try_send(request).await {
                Ok(response) => return Ok(response),
                Err(ctx) if ctx.error.is_retryable() && attempts <= self.max_retries => {
                    let delay: Duration = utils::retry_delay(attempts, ctx.retry_after);
                    warn!(
                        "Error: {} (attempt {}/{}), retrying in {:.1} seconds",
                        ctx.error,
                        attempts,
                        self.max_retries + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ctx) => return Err(ctx.error),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WireRequest) -> Result<String, ApiError> {
        debug!("Sending request to {}", request.url);
        let response = self.send_with_retry(request).await?;
        response
            .text()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))
    }

    async fn open_stream(&self, request: &WireRequest) -> Result<Box<dyn ChunkStream>, ApiError> {
        debug!("Opening stream to {}", request.url);
        let response = self.send_with_retry(request).await?;
        Ok(Box::new(HttpChunkStream::new(response)))
    }
}
