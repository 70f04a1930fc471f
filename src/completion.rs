//! Client for the hosted chat-completion API.
//!
//! The relay only depends on [`CompletionClient`]; [`OpenAiClient`] speaks the
//! OpenAI `/chat/completions` protocol, both single-shot and as an SSE stream.

use crate::error::CompletionError;
use crate::io_struct::{Message, Role};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for PromptMessage {
    fn from(message: &Message) -> Self {
        PromptMessage {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(model: &str, temperature: f64, messages: &[Message]) -> Self {
        CompletionRequest {
            model: model.to_string(),
            messages: messages.iter().map(PromptMessage::from).collect(),
            temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
}

/// One increment of a streamed completion. The final increment usually
/// carries the usage and no text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionDelta {
    pub content: String,
    pub usage: Option<Usage>,
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionDelta, CompletionError>> + Send>>;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, CompletionError>;
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    #[serde(flatten)]
    request: &'a CompletionRequest,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

pub fn parse_completion(body: &[u8]) -> Result<Completion, CompletionError> {
    let completion: ChatCompletion = serde_json::from_slice(body)
        .map_err(|e| CompletionError::Malformed(e.to_string()))?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::Malformed("no choices in response".to_string()))?;
    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        usage: completion.usage,
    })
}

pub fn parse_chunk(data: &str) -> Result<CompletionDelta, CompletionError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(data).map_err(|e| CompletionError::Malformed(e.to_string()))?;
    let content = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect::<String>();
    Ok(CompletionDelta {
        content,
        usage: chunk.usage,
    })
}

/// Parse an SSE block into event name and data.
pub fn parse_sse_block(block: &str) -> (Option<&str>, Cow<'_, str>) {
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    let data = if data_lines.len() == 1 {
        Cow::Borrowed(data_lines[0])
    } else {
        Cow::Owned(data_lines.join("\n"))
    };

    (event_name, data)
}

/// Splits an SSE byte stream into event blocks. Chunk boundaries may fall
/// anywhere, including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk and return the data payloads of every block it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.pending.drain(..pos + 2).collect();
            if let Some(data) = Self::block_data(&block[..pos]) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing block that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.pending);
        Self::block_data(&block)
    }

    fn block_data(block: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(block);
        if text.trim().is_empty() {
            return None;
        }
        let (_, data) = parse_sse_block(&text);
        if data.is_empty() {
            None
        } else {
            Some(data.into_owned())
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        OpenAiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, body: &ChatCompletionBody<'_>) -> Result<reqwest::Response, CompletionError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => format!("failed to read error body: {}", e),
            };
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let body = ChatCompletionBody {
            request,
            stream: false,
            stream_options: None,
        };
        let resp = self.send(&body).await?;
        let bytes = resp.bytes().await?;
        parse_completion(&bytes)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, CompletionError> {
        let body = ChatCompletionBody {
            request,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };
        let resp = self.send(&body).await?;
        let mut upstream = resp.bytes_stream();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = upstream.next().await {
                let chunk: Bytes = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(CompletionError::Network(e)));
                        return;
                    }
                };
                for data in decoder.push(&chunk) {
                    if forward_event(&tx, &data).is_break() {
                        return;
                    }
                }
            }
            if let Some(data) = decoder.finish() {
                let _ = forward_event(&tx, &data);
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn forward_event(
    tx: &mpsc::UnboundedSender<Result<CompletionDelta, CompletionError>>,
    data: &str,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    if data == "[DONE]" {
        return ControlFlow::Break(());
    }
    match parse_chunk(data) {
        Ok(delta) => {
            if tx.send(Ok(delta)).is_err() {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        Err(e) => {
            let _ = tx.send(Err(e));
            ControlFlow::Break(())
        }
    }
}
