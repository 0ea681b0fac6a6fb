//! Server-Sent Events (SSE) stream processing utilities.
//!
//! SSE format:
//! ```text
//! data: {"key": "value"}
//!
//! data: {"another": "event"}
//!
//! data: [DONE]
//! ```

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use crate::client::ClientError;

/// Extension trait for `reqwest::Response` to enable SSE streaming.
///
/// # Example
/// ```ignore
/// use tooltalk::sse::SSEResponseExt;
/// use futures::StreamExt;
///
/// let mut fragments = response.sse_json();
/// while let Some(fragment) = fragments.next().await {
///     println!("fragment: {}", fragment?);
/// }
/// ```
pub trait SSEResponseExt {
    /// Convert the response into a stream of raw SSE data payloads.
    ///
    /// Stops when the `[DONE]` marker is encountered or the body ends.
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send;

    /// Like [`sse`](Self::sse), with every payload parsed as JSON.
    fn sse_json(self) -> impl Stream<Item = Result<Value, ClientError>> + Send
    where
        Self: Sized,
    {
        self.sse()
            .map(|line| line.and_then(|data| serde_json::from_str(&data).map_err(ClientError::from)))
    }
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send {
        sse_lines(self.bytes_stream())
    }
}

/// Split a byte stream into SSE data payloads.
pub fn sse_lines<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, ClientError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ClientError> + Send,
{
    stream::unfold(
        (Box::pin(byte_stream), Utf8Carry::default(), String::new(), false),
        |(mut byte_stream, mut carry, mut buffer, mut stream_ended)| async move {
            loop {
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    if let Some(data) = parse_sse_line(&line) {
                        if is_done_marker(data) {
                            return None;
                        }
                        return Some((
                            Ok(data.to_string()),
                            (byte_stream, carry, buffer, stream_ended),
                        ));
                    }
                }

                if stream_ended {
                    let line = buffer.trim().to_string();
                    buffer.clear();
                    return match parse_sse_line(&line) {
                        Some(data) if !is_done_marker(data) => Some((
                            Ok(data.to_string()),
                            (byte_stream, carry, buffer, stream_ended),
                        )),
                        _ => None,
                    };
                }

                match byte_stream.next().await {
                    Some(Ok(chunk)) => carry.push(chunk.as_ref(), &mut buffer),
                    Some(Err(e)) => {
                        return Some((Err(e.into()), (byte_stream, carry, buffer, stream_ended)));
                    }
                    None => stream_ended = true,
                }
            }
        },
    )
}

/// Holds the tail of a multi-byte character split across network chunks.
#[derive(Default)]
struct Utf8Carry(Vec<u8>);

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8], out: &mut String) {
        self.0.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.0) {
                Ok(text) => {
                    out.push_str(text);
                    self.0.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.0[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.0.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.0.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }
}

/// Parse an SSE line to extract the data portion.
///
/// # Example
/// ```
/// use tooltalk::sse::parse_sse_line;
///
/// assert_eq!(parse_sse_line("data: {\"key\": \"value\"}"), Some("{\"key\": \"value\"}"));
/// assert_eq!(parse_sse_line("data:{}"), Some("{}"));
/// assert_eq!(parse_sse_line("event: ping"), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|s| s.trim())
}

/// Check if an SSE data line indicates the stream is done.
///
/// # Example
/// ```
/// use tooltalk::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(!is_done_marker("{\"data\": \"value\"}"));
/// ```
pub fn is_done_marker(data: &str) -> bool {
    data == "[DONE]"
}
