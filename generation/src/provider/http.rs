//! OpenAI-compatible `/chat/completions` adapter.

use async_trait::async_trait;
use config::ProviderConfig;
use errors::ProviderError;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use gen_core::traits::{CompletionStream, TextGenerationProvider};
use gen_core::types::{ChatMessage, Completion, Prompt, ProviderRequest, StreamDelta, TokenUsage};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

pub struct HttpChatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout_ms: u64
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    presence_penalty: f32,
    frequency_penalty: f32,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<WireContent>,
    #[serde(default)]
    delta: Option<WireContent>
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>
}

impl HttpChatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport {
                reason: format!("Failed to build HTTP client: {e}")
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout_ms: timeout.as_millis() as u64
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms)
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest,
        stream: bool
    ) -> Result<reqwest::Response, ProviderError> {
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: prompt.to_messages(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            stop: &request.stop_sequences,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true
            })
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.map_transport(&e))?;
        let status = response.status();
        debug!(model = %request.model, status = status.as_u16(), stream, "Provider responded");

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(self.map_status(status, retry_after, &body))
    }

    fn map_transport(&self, error: &reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout {
                timeout_ms: self.timeout_ms
            }
        } else {
            ProviderError::Transport {
                reason: error.to_string()
            }
        }
    }

    fn map_status(&self, status: StatusCode, retry_after: Option<u64>, body: &str) -> ProviderError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let message = parsed
            .as_ref()
            .map_or_else(|| body.to_string(), |env| env.error.message.clone());
        let is_quota = parsed.as_ref().is_some_and(|env| {
            env.error.code.as_deref() == Some("insufficient_quota")
                || env.error.error_type.as_deref() == Some("insufficient_quota")
        });

        match status {
            StatusCode::TOO_MANY_REQUESTS if is_quota => ProviderError::QuotaExceeded {
                reason: message
            },
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout {
                timeout_ms: self.timeout_ms
            },
            _ => ProviderError::Api {
                status: Some(status.as_u16()),
                message
            }
        }
    }
}

fn usage_of(wire: Option<&WireUsage>) -> Option<TokenUsage> {
    wire.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
}

#[async_trait]
impl TextGenerationProvider for HttpChatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<Completion, ProviderError> {
        let response = self.send(prompt, request, false).await?;
        let parsed: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    reason: e.to_string()
                })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| ProviderError::InvalidResponse {
                reason: "response has no message content".to_string()
            })?;

        Ok(Completion {
            text,
            usage: usage_of(parsed.usage.as_ref()).unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| request.model.clone())
        })
    }

    async fn complete_stream(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<CompletionStream, ProviderError> {
        let response = self.send(prompt, request, true).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_deltas(bytes))
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamDelta, ProviderError>>,
    finished: bool
}

impl SseState {
    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(String::from_utf8_lossy(&line).trim());
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.finished = true;
            return;
        }

        match serde_json::from_str::<ChatCompletionResponse>(payload) {
            Ok(chunk) => {
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta)
                    .and_then(|delta| delta.content)
                    .unwrap_or_default();
                let usage = usage_of(chunk.usage.as_ref());
                if !content.is_empty() || usage.is_some() {
                    self.pending.push_back(Ok(StreamDelta { content, usage }));
                }
            }
            Err(e) => {
                self.pending.push_back(Err(ProviderError::InvalidResponse {
                    reason: format!("bad stream chunk: {e}")
                }));
                self.finished = true;
            }
        }
    }
}

/// Turns a raw SSE byte stream into completion deltas, stopping at `[DONE]`.
fn sse_deltas(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> CompletionStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(ProviderError::Transport {
                        reason: e.to_string()
                    }));
                    state.finished = true;
                }
                None => {
                    state.buffer.push(b'\n');
                    state.drain_lines();
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
