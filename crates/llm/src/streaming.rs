//! Common streaming infrastructure for LLM providers
//!
//! This module provides the byte-level side of streaming: a chunk source
//! abstraction (live HTTP response or scripted replay) and the SSE decoder
//! that turns raw chunks into `data:` payloads for the adapters.

use crate::ApiError;
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// Trait for streaming chunk sources (real HTTP response or scripted replay)
///
/// This abstraction allows the same stream processing logic to run against
/// live HTTP responses and canned data, ensuring identical behavior.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ApiError>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    pub response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(ApiError::NetworkError(format!("HTTP chunk error: {e}"))),
        }
    }
}

/// Replays a fixed list of chunks, optionally pausing between them
pub struct ReplayChunkStream {
    chunks: VecDeque<Vec<u8>>,
    delay: Option<Duration>,
}

impl ReplayChunkStream {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            delay: None,
        }
    }

    /// Build a stream that emits every payload as one `data:` line
    pub fn from_sse_data<S: AsRef<str>>(payloads: &[S]) -> Self {
        Self::new(
            payloads
                .iter()
                .map(|payload| format!("data: {}\n\n", payload.as_ref()).into_bytes())
                .collect(),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ChunkStream for ReplayChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        if let Some(delay) = self.delay {
            if !self.chunks.is_empty() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(self.chunks.pop_front())
    }
}

/// Incremental server-sent events decoder.
///
/// Chunk boundaries are arbitrary: they may split lines and even multi-byte
/// UTF-8 sequences, so both are buffered until complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending_bytes: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning the `data:` payloads it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(chunk);
        let text = self.take_valid_utf8();

        let mut payloads = Vec::new();
        for c in text.chars() {
            if c == '\n' {
                if let Some(payload) = Self::process_line(&self.line_buffer) {
                    payloads.push(payload);
                }
                self.line_buffer.clear();
            } else {
                self.line_buffer.push(c);
            }
        }
        payloads
    }

    /// Flush a trailing line that was not newline terminated
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending_bytes.is_empty() {
            warn!(
                "Discarding {} bytes of incomplete UTF-8 at end of stream",
                self.pending_bytes.len()
            );
            self.pending_bytes.clear();
        }
        let line = std::mem::take(&mut self.line_buffer);
        Self::process_line(&line).into_iter().collect()
    }

    fn take_valid_utf8(&mut self) -> String {
        match std::str::from_utf8(&self.pending_bytes) {
            Ok(text) => {
                let text = text.to_string();
                self.pending_bytes.clear();
                text
            }
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    // Incomplete sequence at the end, wait for more bytes
                    None => {
                        let rest = self.pending_bytes.split_off(valid);
                        let text = String::from_utf8_lossy(&self.pending_bytes).into_owned();
                        self.pending_bytes = rest;
                        text
                    }
                    Some(_) => {
                        warn!("Invalid UTF-8 in stream, replacing malformed bytes");
                        let text = String::from_utf8_lossy(&self.pending_bytes).into_owned();
                        self.pending_bytes.clear();
                        text
                    }
                }
            }
        }
    }

    fn process_line(line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.is_empty() {
            return None;
        }
        Some(data.to_string())
    }
}
