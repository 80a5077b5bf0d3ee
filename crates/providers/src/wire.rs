//! HTTP plumbing shared by the wire formats: status mapping, transport
//! error description, and the SSE reader that feeds a chunk channel.

use futures::StreamExt;
use tracecheck_core::error::ProviderError;
use tracecheck_core::provider::{ChunkReceiver, StreamChunk};
use tracing::{trace, warn};

/// Capacity of the channel between the SSE reader task and the consumer.
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Seconds to wait after a 429 that carries no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Turn a non-2xx response into the matching [`ProviderError`].
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    let body = response.text().await.unwrap_or_default();
    warn!(provider, status = status.as_u16(), body = %body, "Provider returned error");

    Err(match status.as_u16() {
        429 => ProviderError::RateLimited { retry_after_secs },
        401 | 403 => ProviderError::AuthenticationFailed(if body.is_empty() {
            format!("HTTP {status}")
        } else {
            body
        }),
        code => ProviderError::ApiError {
            status_code: code,
            message: body,
        },
    })
}

/// Map a failed send to `Timeout` or `Network`, keeping the cause chain
/// (reqwest's own message omits it, e.g. "connection refused").
pub(crate) fn send_error(e: reqwest::Error) -> ProviderError {
    ProviderError::transport(describe(&e), e.is_timeout())
}

pub(crate) fn describe(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split across network reads decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    /// Feed bytes; returns the payloads of every completed `data:` line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                out.push(data);
            }
        }
        out
    }

    /// The final line if the stream ended without a newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    // Blank lines, comments and `event:` lines carry nothing we need.
    let data = line.strip_prefix("data:")?.trim();
    (!data.is_empty()).then(|| data.to_string())
}

/// Per-format state machine turning SSE payloads into chunks.
pub(crate) trait SseDecoder: Send + 'static {
    /// Decode one payload. A returned chunk with `done` set ends the stream.
    fn decode(&mut self, data: &str) -> Result<Vec<StreamChunk>, ProviderError>;

    /// Final chunk when the connection closes without a terminal event.
    fn finish(&mut self) -> StreamChunk;
}

/// Read `response` as SSE on a spawned task, decoding with `decoder`.
pub(crate) fn spawn_sse<D: SseDecoder>(
    provider: String,
    response: reqwest::Response,
    mut decoder: D,
) -> ChunkReceiver {
    let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut bytes = response.bytes_stream();
        let mut lines = SseLines::default();

        let mut ended = false;
        while !ended {
            let payloads = match bytes.next().await {
                Some(Ok(b)) => lines.push(&b),
                Some(Err(e)) => {
                    let _ = tx
                        .send(Err(ProviderError::StreamInterrupted(describe(&e))))
                        .await;
                    return;
                }
                None => {
                    ended = true;
                    lines.finish().into_iter().collect()
                }
            };

            for data in payloads {
                trace!(provider = %provider, data = %data, "SSE event");
                match decoder.decode(&data) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            let done = chunk.done;
                            if tx.send(Ok(chunk)).await.is_err() || done {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "Stream failed");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        }

        let _ = tx.send(Ok(decoder.finish())).await;
    });

    rx
}
