use axum::body::Bytes;
use pyrelay_core::{ChatMessage, Role};
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

use crate::llm::{ByteStream, LlmError};

/// Appended to the newest user message before it is forwarded.
pub const FORMAT_INSTRUCTION: &str = "\n\n(Answer in Markdown. Put any code in fenced code blocks \
     with a language tag, and keep explanations short.)";

/// Append [`FORMAT_INSTRUCTION`] to the last user message. Returns false
/// when there is no user message.
pub fn apply_format_instruction(messages: &mut [ChatMessage]) -> bool {
    match messages.iter_mut().rev().find(|m| m.role == Role::User) {
        Some(message) => {
            message.content.push_str(FORMAT_INSTRUCTION);
            true
        }
        None => false,
    }
}

/// Assistant text carried by one chat record (`message.content`) or one
/// generate record (`response`).
pub fn reply_text(record: &Value) -> Option<&str> {
    record
        .pointer("/message/content")
        .or_else(|| record.get("response"))
        .and_then(Value::as_str)
}

/// Accumulates assistant text from an NDJSON byte stream whose chunk
/// boundaries need not line up with record boundaries.
#[derive(Debug, Default)]
pub struct NdjsonText {
    pending: Vec<u8>,
    text: String,
}

impl NdjsonText {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.take_line(&line);
        }
    }

    pub fn finish(mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        self.take_line(&rest);
        self.text
    }

    fn take_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(record) => {
                if let Some(text) = reply_text(&record) {
                    self.text.push_str(text);
                }
            }
            Err(e) => tracing::debug!(error = %e, "skipping malformed chat record"),
        }
    }
}

/// Pass `upstream` through unchanged; once it ends cleanly, call `on_done`
/// with the accumulated assistant text. Not called if the upstream fails or
/// the consumer goes away first.
pub fn tee_stream<F>(
    upstream: ByteStream,
    on_done: F,
) -> impl Stream<Item = Result<Bytes, LlmError>> + Send + 'static
where
    F: FnOnce(String) + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = upstream;
        let mut text = NdjsonText::default();
        let mut failed = false;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    text.feed(&bytes);
                    yield Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "chat stream from LLM failed");
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }
        if !failed {
            on_done(text.finish());
        }
    }
}
