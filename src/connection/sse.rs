//! Long-lived streaming sessions for SSE capability servers
//!
//! An [`SseSession`] holds an open `text/event-stream` response and
//! forwards its `data:` payloads through a channel. The read timeout is
//! extended well beyond the per-request timeout because a healthy
//! stream may be silent for minutes between events.
//!
//! SSE field processing:
//!
//! - `data:` values are joined per event and forwarded.
//! - `event: ping` and `data: [PING]` keep-alives are silently dropped.
//! - Comment lines (leading `:`) and unknown fields are ignored.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{BrokerError, Result};

/// Read timeout for the streaming GET. Five minutes, matching the
/// expectation that a live stream pings at least that often.
const SSE_READ_TIMEOUT_SECS: u64 = 300;

/// An open streaming session to one capability server.
///
/// Dropping the session aborts the background reader task; the HTTP
/// connection closes with it.
#[derive(Debug)]
pub struct SseSession {
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl SseSession {
    /// Opens the event stream.
    ///
    /// Issues a GET with `Accept: text/event-stream` plus the supplied
    /// auth headers, requires a success status, and spawns a background
    /// task that parses the body for the session's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] when the GET fails or the
    /// server answers with a non-success status.
    pub async fn open(
        http: &reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut request = http
            .get(url)
            .timeout(Duration::from_secs(SSE_READ_TIMEOUT_SECS))
            .header("Accept", "text/event-stream");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                BrokerError::Transport(format!("stream endpoint returned {status}")).into(),
            );
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let byte_stream = response.bytes_stream();
        let reader = tokio::spawn(async move {
            parse_sse_stream(byte_stream, event_tx).await;
        });

        Ok(Self {
            event_rx: Arc::new(Mutex::new(event_rx)),
            reader,
        })
    }

    /// Initial capability probe: asks the server to enumerate what it
    /// offers, confirming the connection is live end to end.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] when the probe request fails
    /// or is rejected.
    pub async fn probe(
        http: &reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<()> {
        let mut request = http
            .post(url)
            .timeout(timeout)
            .json(&serde_json::json!({ "method": "capabilities/list" }));
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("capability probe failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                BrokerError::Transport(format!("capability probe returned {status}")).into(),
            );
        }
        Ok(())
    }

    /// Stream of event payloads received from the server.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.event_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Stops the background reader. Idempotent; aborting a finished
    /// task is a no-op.
    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// Parses an SSE byte stream and forwards complete `data:` payloads.
///
/// Runs inside the session's background task and consumes the stream
/// until it ends or errors.
async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    event_tx: mpsc::UnboundedSender<String>,
) {
    use futures::StreamExt;

    // Accumulates raw text between `\n\n` event boundaries.
    let mut buffer = String::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(_) => break,
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(s) => s,
            Err(_) => continue,
        };
        buffer.push_str(text);

        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            forward_sse_event(&event_block, &event_tx);
        }
    }

    if !buffer.is_empty() {
        forward_sse_event(&buffer, &event_tx);
    }
}

/// Processes one SSE event block (the text between two `\n\n`
/// delimiters), forwarding its joined `data:` value unless it is a
/// keep-alive.
fn forward_sse_event(event_block: &str, event_tx: &mpsc::UnboundedSender<String>) {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
        // Comment lines (`:`) and other fields are ignored.
    }

    if let Some(et) = event_type {
        if et.eq_ignore_ascii_case("ping") {
            return;
        }
    }

    let data = data_lines.join("\n");
    if data.eq_ignore_ascii_case("[ping]") || data.is_empty() {
        return;
    }

    let _ = event_tx.send(data);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
