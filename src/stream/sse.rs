//! Server-Sent Events framing for chat completion chunks.
//!
//! ```text
//! data: {"id":"...","object":"chat.completion.chunk","choices":[{"delta":{"content":"."}}]}
//!
//! data: [DONE]
//! ```

use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::StreamChunk;

/// Terminal event
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Identity shared by every chunk of one stream.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// Completion id
    pub id: String,
    /// Model echoed back to the caller
    pub model: String,
    /// Unix seconds
    pub created: i64,
}

impl StreamHeader {
    /// Fresh header for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
        }
    }
}

/// Frame one chunk as an SSE event.
pub fn encode(header: &StreamHeader, chunk: &StreamChunk) -> String {
    if chunk.is_done() {
        return DONE_EVENT.to_string();
    }
    let payload = json!({
        "id": header.id,
        "model": header.model,
        "object": "chat.completion.chunk",
        "created": header.created,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": chunk.content()},
            "finish_reason": chunk.finish_reason(),
        }],
    });
    format!("data: {payload}\n\n")
}

/// Byte stream for an HTTP response body.
pub fn event_stream(
    header: StreamHeader,
    chunks: mpsc::Receiver<StreamChunk>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    ReceiverStream::new(chunks).map(move |chunk| Ok(Bytes::from(encode(&header, &chunk))))
}
