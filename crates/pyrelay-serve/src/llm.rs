use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use pyrelay_core::config::LlmConfig;
use pyrelay_core::ChatMessage;
use serde_json::{json, Value};
use tokio_stream::{Stream, StreamExt};

/// Failure talking to the inference daemon.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("LLM request timed out")]
    TimedOut,
    #[error("LLM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("malformed LLM response: {0}")]
    Malformed(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

/// Reply to a chat request: a full JSON document, or raw NDJSON chunks.
pub enum ChatReply {
    Complete(Value),
    Stream(ByteStream),
}

/// Text-completion and chat endpoint. Implemented by [`OllamaBackend`]
/// and [`MockBackend`] (tests).
#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync {
    /// Single non-streaming completion; returns the generated text.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        stream: bool,
        model: Option<&str>,
    ) -> Result<ChatReply, LlmError>;
}

// ── Ollama ──

const ERROR_BODY_LIMIT: usize = 500;

pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        truncate(&mut body, ERROR_BODY_LIMIT);
        Err(LlmError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::TimedOut
    } else if err.is_connect() {
        LlmError::Unreachable(err.to_string())
    } else if err.is_decode() {
        LlmError::Malformed(err.to_string())
    } else {
        LlmError::Transport(err.to_string())
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

#[async_trait::async_trait]
impl LlmBackend for OllamaBackend {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .http
            .post(self.url("api/generate"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;
        let resp = Self::check_status(resp).await?;
        let value: Value = resp.json().await.map_err(classify)?;
        value
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("missing `response` field".into()))
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        stream: bool,
        model: Option<&str>,
    ) -> Result<ChatReply, LlmError> {
        let body = json!({
            "model": model.unwrap_or(self.model.as_str()),
            "messages": messages,
            "stream": stream,
        });
        let request = self.http.post(self.url("api/chat")).json(&body);

        if !stream {
            let resp = request
                .timeout(self.timeout)
                .send()
                .await
                .map_err(classify)?;
            let resp = Self::check_status(resp).await?;
            let value: Value = resp.json().await.map_err(classify)?;
            return Ok(ChatReply::Complete(value));
        }

        // Only the response headers are bounded; a long generation may
        // keep streaming past the timeout.
        let resp = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| LlmError::TimedOut)?
            .map_err(classify)?;
        let resp = Self::check_status(resp).await?;
        let chunks = resp.bytes_stream().map(|chunk| chunk.map_err(classify));
        Ok(ChatReply::Stream(Box::pin(chunks)))
    }
}

// ── Mock ──

/// Scripted backend. Pops one queued reply per call; when the queue is
/// empty every call succeeds with [`MockBackend::DEFAULT_REPLY`].
pub struct MockBackend {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    chats: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Option<Duration>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub const DEFAULT_REPLY: &'static str = "mock analysis";

    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            chats: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_reply(&self, reply: Result<String, LlmError>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Prompts received by `generate`, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Message lists received by `chat`, in call order.
    pub fn chats(&self) -> Vec<Vec<ChatMessage>> {
        self.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn next_reply(&self) -> Result<String, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::DEFAULT_REPLY.to_string()))
    }
}

#[async_trait::async_trait]
impl LlmBackend for MockBackend {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.next_reply().await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        stream: bool,
        model: Option<&str>,
    ) -> Result<ChatReply, LlmError> {
        self.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        let text = self.next_reply().await?;
        let model = model.unwrap_or("mock").to_string();
        if !stream {
            return Ok(ChatReply::Complete(json!({
                "model": model,
                "message": { "role": "assistant", "content": text },
                "done": true,
            })));
        }
        // One NDJSON line per word, then the terminating record.
        let mut lines: Vec<String> = text
            .split_inclusive(' ')
            .map(|piece| {
                json!({
                    "model": model,
                    "message": { "role": "assistant", "content": piece },
                    "done": false,
                })
                .to_string()
            })
            .collect();
        lines.push(json!({ "model": model, "done": true }).to_string());
        let chunks: Vec<Result<Bytes, LlmError>> = lines
            .into_iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
            .collect();
        Ok(ChatReply::Stream(Box::pin(tokio_stream::iter(chunks))))
    }
}
