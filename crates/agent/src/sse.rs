//! HTTP and server-sent events plumbing shared by the reqwest-based providers.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt, stream};
use proto::LlmError;
use tracing::debug;

use crate::llm::{EventStream, StreamEvent};

/// Sends a request and turns non-2xx statuses into typed errors.
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, LlmError> {
    let response = request
        .send()
        .await
        .map_err(|e| LlmError::Transport(e.to_string()))?;
    let status = response.status();
    debug!(status = %status.as_u16(), "Provider response received");
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), &body))
}

/// Maps an error status and body to an [`LlmError`], preferring the vendor's
/// `error.message` when the body is JSON.
pub(crate) fn status_error(status: u16, body: &str) -> LlmError {
    if status == 429 {
        return LlmError::RateLimit;
    }
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v["error"]["message"]
                .as_str()
                .or_else(|| v["error"].as_str())
                .or_else(|| v["message"].as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(500).collect());
    LlmError::Api { status, message }
}

/// Vendor-specific interpretation of SSE frames.
pub(crate) trait FrameHandler: Send + 'static {
    /// Handles one frame, queueing any events. Returns `true` once the
    /// response is complete (a `Complete` event has been queued).
    fn on_frame(
        &mut self,
        frame: SseFrame,
        out: &mut VecDeque<StreamEvent>,
    ) -> Result<bool, LlmError>;

    /// Final event when the body ends before completion.
    fn on_eof(&mut self) -> StreamEvent;
}

/// Drives a frame stream through a handler, producing provider events.
///
/// The stream stops after the first `Complete` or `Error`.
pub(crate) fn into_event_stream<F, H>(frames: F, handler: H) -> EventStream
where
    F: Stream<Item = Result<SseFrame, LlmError>> + Send + 'static,
    H: FrameHandler,
{
    let frames = Box::pin(frames);
    Box::pin(stream::unfold(
        (frames, handler, VecDeque::new(), false),
        |(mut frames, mut handler, mut queue, mut done)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((event, (frames, handler, queue, done)));
                }
                if done {
                    return None;
                }
                match frames.next().await {
                    Some(Ok(frame)) => match handler.on_frame(frame, &mut queue) {
                        Ok(complete) => done = complete,
                        Err(e) => {
                            done = true;
                            queue.push_back(StreamEvent::Error(e));
                        }
                    },
                    Some(Err(e)) => {
                        done = true;
                        queue.push_back(StreamEvent::Error(e));
                    }
                    None => {
                        done = true;
                        queue.push_back(handler.on_eof());
                    }
                }
            }
        },
    ))
}

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, `message` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Splits a byte stream into SSE frames.
///
/// Bytes are buffered until a blank line so multi-byte characters and frames
/// split across chunks decode intact. CRLF line endings are accepted. Comment
/// lines and frames without fields are skipped. A transport error is yielded
/// once and ends the stream.
pub fn decode_sse<S, B, E>(bytes_stream: S) -> impl Stream<Item = Result<SseFrame, LlmError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut finished)| async move {
            loop {
                if let Some((frame_end, sep_len)) = find_frame_end(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..frame_end + sep_len).collect();
                    if let Some(frame) = parse_frame(&raw[..frame_end]) {
                        return Some((Ok(frame), (stream, buffer, finished)));
                    }
                    continue;
                }

                if finished {
                    // Flush a trailing frame that was not followed by a blank line.
                    if buffer.is_empty() {
                        return None;
                    }
                    let raw = std::mem::take(&mut buffer);
                    match parse_frame(&raw) {
                        Some(frame) => return Some((Ok(frame), (stream, buffer, finished))),
                        None => return None,
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        buffer.clear();
                        finished = true;
                        return Some((
                            Err(LlmError::Transport(e.to_string())),
                            (stream, buffer, finished),
                        ));
                    }
                    None => finished = true,
                }
            }
        },
    )
}

/// Position of the first blank-line separator and its length.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = String::new();
    let mut data_lines = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}
