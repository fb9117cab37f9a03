use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Errors raised while talking to the text-completion service
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Completion service is currently busy. Please try again in a few moments.")]
    ServerBusy,

    #[error("Network connection failed: {message}")]
    NetworkError { message: String },

    #[error("Request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {message}")]
    ParseError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

impl LlmError {
    pub fn is_server_busy(&self) -> bool {
        matches!(self, LlmError::ServerBusy)
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, LlmError::NetworkError { .. })
    }

    /// Busy and network failures are worth another attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        self.is_server_busy() || self.is_network_error()
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            LlmError::ServerBusy => {
                "🚫 The completion service is busy. Please try again in a few moments.".to_string()
            }
            LlmError::NetworkError { .. } => {
                "🌐 Network connection failed. Please check your connection and try again."
                    .to_string()
            }
            LlmError::Timeout { seconds } => {
                format!(
                    "⏰ Request timed out after {} seconds. The server might be overloaded.",
                    seconds
                )
            }
            LlmError::ApiError { status, .. } => match *status {
                401 | 403 => "🔑 The API key was rejected. Check LLM_API_KEY.".to_string(),
                429 => {
                    "🚫 Rate limit exceeded. Please wait a moment before trying again.".to_string()
                }
                _ => format!("❌ API error ({}). Please try again later.", status),
            },
            LlmError::ParseError { .. } => {
                "⚠️ Failed to parse server response. Please try again.".to_string()
            }
            LlmError::ConfigError { message } => {
                format!("⚙️ Configuration error: {}", message)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Role name on the wire. Tool results travel as user turns because the
    /// tool protocol is plain text, not native function calling.
    fn wire_name(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A stream of text chunks from a streamed completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// The text-completion service the workflows call into.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// Stream the reply. Clients without native streaming yield one chunk.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream, LlmError> {
        let text = self.complete(messages).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

/// Drain a text stream into one string.
pub async fn collect_stream(mut stream: TextStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
    config: Config,
}

impl fmt::Debug for HttpCompletionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCompletionClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl HttpCompletionClient {
    pub fn new(config: Config) -> Result<Self, LlmError> {
        config.validate().map_err(|e| LlmError::ConfigError {
            message: e.to_string(),
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(concat!("agent_workflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LlmError::ConfigError {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    /// Retry retryable failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let mut attempts = 0;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempts < MAX_ATTEMPTS - 1 => {
                    attempts += 1;
                    warn!(
                        attempt = attempts,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "completion request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage { role: m.role.wire_name(), content: &m.content })
                .collect(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.handle_error_response(status, response).await);
        }
        Ok(response)
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let response = self.send(messages, false).await?;
        let api_response: ApiResponse = response.json().await.map_err(|e| LlmError::ParseError {
            message: format!("Failed to parse API response: {}", e),
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| LlmError::ParseError {
            message: "No choices in API response".to_string(),
        })?;
        choice.message.content.ok_or_else(|| LlmError::ParseError {
            message: "Empty content in API response".to_string(),
        })
    }

    /// Map reqwest errors to our custom error types
    fn map_reqwest_error(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            return LlmError::Timeout {
                seconds: self.config.timeout,
            };
        }

        if error.is_connect() {
            return LlmError::NetworkError {
                message: "Failed to connect to server".to_string(),
            };
        }

        let error_msg = error.to_string().to_lowercase();
        if error_msg.contains("dns") {
            return LlmError::NetworkError {
                message: "DNS resolution failed".to_string(),
            };
        }

        if error_msg.contains("connection refused") {
            return LlmError::NetworkError {
                message: "Connection refused by server".to_string(),
            };
        }

        LlmError::NetworkError {
            message: format!("Request error: {}", error),
        }
    }

    async fn handle_error_response(
        &self,
        status: StatusCode,
        response: reqwest::Response,
    ) -> LlmError {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status {
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::BAD_GATEWAY
            | StatusCode::GATEWAY_TIMEOUT => LlmError::ServerBusy,
            _ => LlmError::ApiError {
                status: status.as_u16(),
                message: error_text,
            },
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.with_retry(|| self.complete_once(messages)).await
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream, LlmError> {
        let response = self.with_retry(|| self.send(messages, true)).await?;
        let timeout = self.config.timeout;

        let state =
            (response.bytes_stream().boxed(), SseDecoder::default(), VecDeque::new(), false);
        let stream = futures::stream::unfold(state, move |state| async move {
            let (mut bytes, mut decoder, mut pending, mut done) = state;
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                let events = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        done = true;
                        let err = if e.is_timeout() {
                            LlmError::Timeout { seconds: timeout }
                        } else {
                            LlmError::NetworkError { message: format!("Stream interrupted: {}", e) }
                        };
                        return Some((Err(err), (bytes, decoder, pending, done)));
                    }
                    None => {
                        done = true;
                        decoder.finish()
                    }
                };
                for event in events {
                    match event {
                        SseEvent::Delta(text) => pending.push_back(text),
                        SseEvent::Done => done = true,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseEvent {
    Delta(String),
    Done,
}

/// Reassembles server-sent event lines that may be split across network chunks.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the body ends without a trailing newline.
    pub(crate) fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

fn decode_line(line: &str) -> Option<SseEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map(SseEvent::Delta),
        Err(e) => {
            debug!(error = %e, "skipping unparsable stream line");
            None
        }
    }
}
