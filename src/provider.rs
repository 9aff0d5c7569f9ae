//! Model Provider Abstraction
//!
//! One OpenAI-compatible chat client covering Gemini (through its
//! OpenAI-compatible endpoint), OpenAI, Ollama and custom local servers.
//! Used for intent classification, guide generation and grounding.

use crate::error::ApiError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Provider families we know how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Gemini,
    OpenAI,
    Ollama,
    LocalCustom,
}

impl ProviderType {
    pub fn name(self) -> &'static str {
        match self {
            ProviderType::Gemini => "gemini",
            ProviderType::OpenAI => "openai",
            ProviderType::Ollama => "ollama",
            ProviderType::LocalCustom => "local_custom",
        }
    }

    fn default_endpoint(self) -> Option<&'static str> {
        match self {
            ProviderType::Gemini => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            ProviderType::OpenAI => Some("https://api.openai.com/v1"),
            ProviderType::Ollama => Some("http://localhost:11434/v1"),
            ProviderType::LocalCustom => None,
        }
    }

    /// Environment variables consulted, in order, when no key is configured.
    fn credential_env_vars(self) -> &'static [&'static str] {
        match self {
            ProviderType::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderType::OpenAI => &["OPENAI_API_KEY"],
            ProviderType::Ollama | ProviderType::LocalCustom => &[],
        }
    }

    fn requires_credentials(self) -> bool {
        matches!(self, ProviderType::Gemini | ProviderType::OpenAI)
    }
}

/// Provider configuration as read from the `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider_type: ProviderType,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            model: default_model(),
            endpoint: None,
            api_key: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| format!("Invalid endpoint URL '{}': {}", endpoint, e))?;
        }
        if self.provider_type == ProviderType::LocalCustom && self.endpoint.is_none() {
            return Err("local_custom provider requires an endpoint".to_string());
        }
        Ok(())
    }

    /// Resolve the API key: explicit config first, then the provider's
    /// environment variables. `Ok(None)` for providers that need no key.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ApiError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.clone()));
        }
        for var in self.provider_type.credential_env_vars() {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    return Ok(Some(value));
                }
            }
        }
        if self.provider_type.requires_credentials() {
            return Err(ApiError::MissingCredentials(format!(
                "set provider.api_key or one of {}",
                self.provider_type.credential_env_vars().join(", ")
            )));
        }
        Ok(None)
    }

    pub fn resolved_endpoint(&self) -> Result<String, ApiError> {
        self.endpoint
            .clone()
            .or_else(|| self.provider_type.default_endpoint().map(str::to_string))
            .map(|e| e.trim_end_matches('/').to_string())
            .ok_or_else(|| ApiError::ConfigError("Provider endpoint is not configured".to_string()))
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Completion options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Streaming completion type: lazily produced text deltas.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Model provider client trait
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    /// Generate a completion from a list of messages
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError>;

    /// Generate a streaming completion
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_status_error(status: u16, body: &str) -> ApiError {
    match status {
        401 | 403 => ApiError::ProviderAuthFailed(format!("Authentication failed: {}", body)),
        404 => ApiError::ProviderModelNotFound(format!("Model not found: {}", body)),
        429 => ApiError::ProviderRateLimit(format!("Rate limit exceeded: {}", body)),
        500..=599 => ApiError::ProviderUnavailable(format!("Server error {}: {}", status, body)),
        _ => ApiError::ProviderRequestFailed(format!("Request failed with status {}: {}", status, body)),
    }
}

// Helper function to map HTTP errors to ApiError
fn map_http_error(error: reqwest::Error) -> ApiError {
    if let Some(status) = error.status() {
        map_status_error(status.as_u16(), &error.to_string())
    } else if error.is_timeout() {
        ApiError::ProviderTimeout(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ApiError::ProviderUnavailable(format!("Connection error: {}", error))
    } else {
        ApiError::ProviderError(format!("HTTP error: {}", error))
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Whole-request bound for non-streaming calls only
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest silence tolerated while a streamed answer is open
pub const PROVIDER_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// No overall timeout here: a streamed answer may legitimately run for
// minutes, so streams are bounded per read instead.
fn build_provider_http_client() -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ApiError::ProviderError(format!("Failed to create HTTP client: {}", e)))
}

/// Client for any `chat/completions` compatible endpoint.
pub struct OpenAICompatibleClient {
    client: Client,
    provider_name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    defaults: CompletionOptions,
    stream_idle_timeout: Duration,
}

impl OpenAICompatibleClient {
    pub fn new(
        provider_name: impl Into<String>,
        model: String,
        base_url: String,
        api_key: Option<String>,
        defaults: CompletionOptions,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_provider_http_client()?,
            provider_name: provider_name.into(),
            model,
            api_key,
            base_url,
            defaults,
            stream_idle_timeout: PROVIDER_STREAM_IDLE_TIMEOUT,
        })
    }

    /// Fail a stream that goes this long without receiving a byte.
    pub fn with_stream_idle_timeout(mut self, idle: Duration) -> Self {
        self.stream_idle_timeout = idle;
        self
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
        stream: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature.or(self.defaults.temperature),
            max_tokens: options.max_tokens.or(self.defaults.max_tokens),
            stream,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }
        if !stream {
            builder = builder.timeout(PROVIDER_HTTP_REQUEST_TIMEOUT);
        }

        let send = builder.json(&request).send();
        let response = if stream {
            tokio::time::timeout(self.stream_idle_timeout, send)
                .await
                .map_err(|_| {
                    ApiError::ProviderTimeout(format!(
                        "No response within {:?}",
                        self.stream_idle_timeout
                    ))
                })?
        } else {
            send.await
        }
        .map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status_error(status, &error_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProviderClient for OpenAICompatibleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        let response = self.post(&messages, options, false).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::ProviderError(format!("Failed to parse response: {}", e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::ProviderError("No choices in response".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: completion.model,
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        let response = self.post(&messages, options, true).await?;
        debug!(provider = %self.provider_name, model = %self.model, "Streaming completion opened");
        Ok(sse_text_stream(response, self.stream_idle_timeout))
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// One decoded server-sent-events line.
#[derive(Debug, PartialEq, Eq)]
enum SseFrame {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseFrame {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseFrame::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseFrame::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.content)
            .reduce(|mut acc, s| {
                acc.push_str(&s);
                acc
            })
            .map(SseFrame::Delta)
            .unwrap_or(SseFrame::Skip),
        Err(e) => {
            debug!(error = %e, "Skipping malformed stream frame");
            SseFrame::Skip
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ApiError>>,
    done: bool,
    idle: Duration,
}

impl SseState {
    fn drain_lines(&mut self, flush: bool) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&String::from_utf8_lossy(&line));
            if self.done {
                return;
            }
        }
        if flush && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.push_line(&String::from_utf8_lossy(&rest));
        }
    }

    fn push_line(&mut self, line: &str) {
        match parse_sse_line(line) {
            SseFrame::Delta(text) => self.pending.push_back(Ok(text)),
            SseFrame::Done => self.done = true,
            SseFrame::Skip => {}
        }
    }
}

fn sse_text_stream(response: reqwest::Response, idle: Duration) -> CompletionStream {
    let state = SseState {
        bytes: Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec()))),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
        idle,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            let next = match tokio::time::timeout(st.idle, st.bytes.next()).await {
                Ok(next) => next,
                Err(_) => {
                    st.done = true;
                    let err = ApiError::ProviderTimeout(format!("Stream idle for {:?}", st.idle));
                    return Some((Err(err), st));
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(&chunk);
                    st.drain_lines(false);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(map_http_error(e)), st));
                }
                None => {
                    st.drain_lines(true);
                    st.done = true;
                }
            }
        }
    }))
}

/// Provider factory for creating clients
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create_client(config: &ProviderConfig) -> Result<Arc<dyn ModelProviderClient>, ApiError> {
        config.validate().map_err(ApiError::ConfigError)?;
        let api_key = config.resolve_api_key()?;
        let endpoint = config.resolved_endpoint()?;
        let client = OpenAICompatibleClient::new(
            config.provider_type.name(),
            config.model.clone(),
            endpoint,
            api_key,
            CompletionOptions {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
        )?;
        Ok(Arc::new(client))
    }
}

/// Client built on first use instead of at load time.
///
/// While credentials are missing every call fails with `MissingCredentials`
/// and the next call tries again, so a key exported after startup takes
/// effect without reloading the backend.
pub struct DeferredClient {
    config: ProviderConfig,
    resolved: Mutex<Option<Arc<dyn ModelProviderClient>>>,
}

impl DeferredClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            resolved: Mutex::new(None),
        }
    }

    pub fn resolve(&self) -> Result<Arc<dyn ModelProviderClient>, ApiError> {
        let mut resolved = self.resolved.lock();
        if let Some(client) = resolved.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = ProviderFactory::create_client(&self.config)?;
        debug!(provider = client.provider_name(), model = client.model_name(), "Provider client resolved");
        *resolved = Some(Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl ModelProviderClient for DeferredClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        self.resolve()?.complete(messages, options).await
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        self.resolve()?.stream(messages, options).await
    }

    fn provider_name(&self) -> &str {
        self.config.provider_type.name()
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
