//! reqwest-backed client for an Anthropic-style messages API.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::error::{ProviderError, ProviderResult};
use super::types::{Completion, CompletionRequest, Message};
use super::{CompletionBackend, FragmentStream};

/// Fragments buffered between the provider read loop and the consumer.
/// Small by intent: a slow consumer should pace provider reads.
const FRAGMENT_BUFFER: usize = 32;

/// Provider connection settings, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the messages API.
    pub base_url: String,
    /// API key. `None` falls back to the `ANTHROPIC_API_KEY` env var at
    /// startup; if neither is set the backend stays unconfigured.
    pub api_key: Option<String>,
    /// Model identifier sent with every request.
    pub model: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// API version header value.
    pub api_version: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            model: "claude-3-sonnet-20240229".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            api_version: "2023-06-01".to_string(),
        }
    }
}

/// Production completion client.
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// A parsed frame of the provider's event stream.
#[derive(Debug, PartialEq)]
enum StreamFrame {
    /// A text fragment.
    Delta(String),
    /// Normal end of the message.
    Stop,
    /// Provider-reported error.
    Error(String),
    /// Anything else (message_start, content_block_start, ping, ...).
    Other,
}

fn parse_stream_frame(data: &str) -> StreamFrame {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return StreamFrame::Other;
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => {
            let text = value
                .get("delta")
                .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str());
            match text {
                Some(text) => StreamFrame::Delta(text.to_string()),
                None => StreamFrame::Other,
            }
        }
        Some("message_stop") => StreamFrame::Stop,
        Some("error") => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error");
            StreamFrame::Error(message.to_string())
        }
        _ => StreamFrame::Other,
    }
}

impl ProviderClient {
    /// Create a client from resolved settings.
    pub fn new(config: ProviderConfig, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            api_key,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn wire_request<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> WireRequest<'a> {
        WireRequest {
            model: &self.config.model,
            system: &request.system,
            messages: request.messages(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        }
    }
}

#[async_trait]
impl CompletionBackend for ProviderClient {
    async fn complete(&self, request: CompletionRequest) -> ProviderResult<Completion> {
        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&self.wire_request(&request, false))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let parsed: WireResponse = response.json().await?;
        let text: String = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect();
        if text.is_empty() {
            return Err(ProviderError::MissingText);
        }

        debug!(message_id = %parsed.id, "completion received");
        Ok(Completion {
            text,
            message_id: parsed.id,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> ProviderResult<FragmentStream> {
        let builder = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .header("accept", "text/event-stream")
            .json(&self.wire_request(&request, true));

        let mut source =
            EventSource::new(builder).map_err(|e| ProviderError::Stream(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<ProviderResult<String>>(FRAGMENT_BUFFER);

        tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(SseEvent::Open) => {}
                    Ok(SseEvent::Message(message)) => match parse_stream_frame(&message.data) {
                        StreamFrame::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                // Consumer gone: stop reading the provider.
                                return;
                            }
                        }
                        StreamFrame::Stop => return,
                        StreamFrame::Error(message) => {
                            let _ = tx.send(Err(ProviderError::Stream(message))).await;
                            return;
                        }
                        StreamFrame::Other => {}
                    },
                    Err(reqwest_eventsource::Error::StreamEnded) => return,
                    Err(err) => {
                        let _ = tx.send(Err(ProviderError::Stream(err.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
