//! OpenAI-compatible streaming chat completions

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatRequest, ChatSource, TextStream};
use crate::{Error, Result};

/// Request body for `/chat/completions`
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

/// One server-sent `data:` payload
#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Parsed meaning of a `data:` payload
#[derive(Debug, PartialEq, Eq)]
enum Payload {
    Delta(String),
    Done,
}

/// Splits a server-sent-events byte stream into `data:` payloads
#[derive(Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    /// Feed raw bytes, returning every complete `data:` payload
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn parse_payload(data: &str) -> Result<Payload> {
    if data == "[DONE]" {
        return Ok(Payload::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(Error::Chat(error.message));
    }

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();
    Ok(Payload::Delta(text))
}

/// Streams chat completions from an OpenAI-compatible endpoint
pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChat {
    /// Create a chat client for `base_url` (e.g. `https://api.openai.com/v1`)
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, base_url: impl Into<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for chat".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl ChatSource for OpenAiChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream> {
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "opening chat stream"
        );

        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("chat API error {status}: {body}")));
        }

        let stream = async_stream::stream! {
            let upstream = response.bytes_stream();
            tokio::pin!(upstream);
            let mut lines = SseLines::default();

            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::from(e));
                        return;
                    }
                };

                for data in lines.push(&chunk) {
                    match parse_payload(&data) {
                        Ok(Payload::Done) => return,
                        Ok(Payload::Delta(text)) if text.is_empty() => {}
                        Ok(Payload::Delta(text)) => yield Ok(text),
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
