//! Core proxy logic: forward a request to its allow-listed upstream,
//! stream the response back byte-for-byte, and feed a decoded copy to the
//! vendor parser so the conversation can be captured.
//!
//! Includes automatic retry with exponential backoff for transient
//! transport errors. Client disconnects stop writes but never stop the
//! capture.

use crate::domains::AuthType;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::normalize;
use crate::parsers::StreamAccumulator;
use crate::persist::{ConversationRecord, QueueHandle};

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Absolute character limit for prompt text, checked before forwarding.
pub const MAX_PROMPT_CHARS: usize = 8_000_000;

/// Build the upstream header set: the client's `Authorization` and every
/// `x-*` header pass through verbatim; the proxy holds no secrets of its
/// own.
pub fn forward_headers(client_headers: &axum::http::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in client_headers {
        let keep = name == &axum::http::header::AUTHORIZATION || name.as_str().starts_with("x-");
        if !keep {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }

    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers
}

/// Total prompt text length: `messages[].content` for OpenAI/Anthropic
/// shapes plus `contents[].parts[].text` for Gemini shapes.
pub fn prompt_char_count(body: &Value) -> usize {
    let mut total = 0;

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for msg in messages {
            match msg.get("content") {
                Some(Value::String(s)) => total += s.chars().count(),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            total += text.chars().count();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(contents) = body.get("contents").and_then(Value::as_array) {
        for content in contents {
            if let Some(parts) = content.get("parts").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        total += text.chars().count();
                    }
                }
            }
        }
    }

    total
}

/// Whether the request asks for a streamed response.
pub fn wants_stream(body: &Value, path: &str) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
        || path.contains("streamGenerateContent")
}

/// POST to the upstream, retrying transient transport failures (connect,
/// timeout, reset) up to [`MAX_ATTEMPTS`] with backoff starting at one
/// second and doubling. HTTP error statuses are returned, not retried.
pub async fn send_with_retry(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    logger: &SharedLogger,
) -> Result<reqwest::Response> {
    let mut delay = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        let mut request = client
            .request(method.clone(), url)
            .headers(headers.clone());
        if let Some(ref bytes) = body {
            request = request.body(bytes.clone());
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) => return Ok(response),
            Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                logger.warn(
                    "retry",
                    format!(
                        "Attempt {attempt}/{MAX_ATTEMPTS} to {url} failed ({e}), retrying in {delay:?}"
                    ),
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                return Err(ProxyError::upstream(format!(
                    "Upstream request to {url} failed: {e}"
                )))
            }
        }
    }

    unreachable!()
}

/// Connect failures, timeouts, and reset/broken-pipe style I/O errors are
/// worth another attempt; anything else is not.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }
    false
}

/// Everything the deferred capture needs once the response bytes are in.
pub struct CaptureContext {
    pub auth_type: AuthType,
    pub model: String,
    pub request_body: Value,
    pub queue: QueueHandle,
    pub logger: SharedLogger,
}

/// Tee an upstream SSE response: every chunk is written to the returned
/// body exactly as received, while a decoded copy feeds the vendor parser
/// line by line. If the client goes away, writing stops but parsing runs
/// to completion and the conversation is still queued.
pub fn capture_stream(response: reqwest::Response, ctx: CaptureContext) -> Body {
    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut byte_stream = response.bytes_stream();
        let mut acc = StreamAccumulator::new();
        let mut line_buf = String::new();
        let mut client_gone = false;

        while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    ctx.logger.error("stream", format!("Upstream stream error: {e}"));
                    break;
                }
            };

            if !client_gone && tx.send(Ok(bytes.clone())).await.is_err() {
                client_gone = true;
                ctx.logger
                    .info("stream", "Client disconnected; capture continues");
            }

            line_buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim();
                if !line.is_empty() {
                    ctx.auth_type.parse_incremental(line, &mut acc);
                }
            }
        }

        let tail = line_buf.trim().to_string();
        if !tail.is_empty() {
            ctx.auth_type.parse_incremental(&tail, &mut acc);
        }

        finalize_stream_capture(acc, &ctx);
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Queue the finished stream. A stream that never surfaced a response id is
/// not persisted.
fn finalize_stream_capture(acc: StreamAccumulator, ctx: &CaptureContext) {
    let finalized = acc.finalize();
    let Some(id) = finalized.response_id.clone() else {
        ctx.logger
            .debug("capture", "Stream ended without a response id, skipping");
        return;
    };
    if finalized.is_empty() {
        return;
    }

    match normalize::normalize(
        ctx.auth_type,
        &ctx.request_body,
        &finalized.text,
        &finalized.tool_calls,
    ) {
        Ok(conversation) => {
            ctx.queue
                .enqueue(ConversationRecord::new(id, ctx.model.clone(), conversation));
        }
        Err(e) => ctx
            .logger
            .error("capture", format!("Normalization failed for {id}: {e}")),
    }
}

/// Capture a complete (non-streamed) response body. Runs after the client
/// response is already on the wire; a missing upstream id gets a minted one.
pub fn capture_complete(body_text: String, ctx: CaptureContext) {
    let mut acc = StreamAccumulator::new();
    ctx.auth_type.parse_final(&body_text, &mut acc);

    let finalized = acc.finalize();
    if finalized.is_empty() {
        return;
    }
    let id = finalized
        .response_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match normalize::normalize(
        ctx.auth_type,
        &ctx.request_body,
        &finalized.text,
        &finalized.tool_calls,
    ) {
        Ok(conversation) => {
            ctx.queue
                .enqueue(ConversationRecord::new(id, ctx.model.clone(), conversation));
        }
        Err(e) => ctx
            .logger
            .error("capture", format!("Normalization failed for {id}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forward_headers_keeps_auth_and_x_headers() {
        let mut client_headers = axum::http::HeaderMap::new();
        client_headers.insert("authorization", "Bearer sk-123".parse().unwrap());
        client_headers.insert("x-api-key", "secret".parse().unwrap());
        client_headers.insert("x-goog-api-key", "gk".parse().unwrap());
        client_headers.insert("accept", "application/json".parse().unwrap());
        client_headers.insert("user-agent", "curl/8".parse().unwrap());

        let forwarded = forward_headers(&client_headers);

        assert_eq!(forwarded.get("authorization").unwrap(), "Bearer sk-123");
        assert_eq!(forwarded.get("x-api-key").unwrap(), "secret");
        assert_eq!(forwarded.get("x-goog-api-key").unwrap(), "gk");
        assert_eq!(forwarded.get("content-type").unwrap(), "application/json");
        assert!(forwarded.get("accept").is_none());
        assert!(forwarded.get("user-agent").is_none());
    }

    #[test]
    fn test_prompt_char_count_openai_shape() {
        let body = json!({"messages": [
            {"role": "user", "content": "abcde"},
            {"role": "assistant", "content": [{"type": "text", "text": "xyz"}]}
        ]});
        assert_eq!(prompt_char_count(&body), 8);
    }

    #[test]
    fn test_prompt_char_count_gemini_shape() {
        let body = json!({"contents": [
            {"role": "user", "parts": [{"text": "abc"}, {"text": "de"}]}
        ]});
        assert_eq!(prompt_char_count(&body), 5);
    }

    #[test]
    fn test_wants_stream() {
        assert!(wants_stream(&json!({"stream": true}), "/v1/chat/completions"));
        assert!(!wants_stream(&json!({"stream": false}), "/v1/chat/completions"));
        assert!(!wants_stream(&json!({}), "/v1/chat/completions"));
        assert!(wants_stream(
            &json!({}),
            "/v1beta/models/gemini-2.0-flash:streamGenerateContent"
        ));
    }
}
