//! Client side of a conversation: the per-turn state machine, the transport
//! it talks to the relay through, and the hooks a front-end renders from.

use crate::error::TransportError;
use crate::io_struct::{ChatReqInput, ChatResponse, Judgment, Message, Role, ScoreReqInput};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Composing,
    Sending,
    Streaming,
    Idle,
    Errored,
}

/// Decoded text chunks of a relay reply.
pub type ReplyChunks = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start a turn. Resolves once the reply body becomes readable.
    async fn send_chat(&self, request: &ChatReqInput) -> Result<ReplyChunks, TransportError>;

    async fn send_score(&self, request: &ScoreReqInput) -> Result<(), TransportError>;
}

/// Front-end hooks, called synchronously from the session.
pub trait Renderer {
    fn state_changed(&mut self, _state: TurnState) {}

    /// Called after every change to a message, including each streamed chunk.
    fn message_updated(&mut self, message: &Message);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Blank input, nothing was sent.
    Skipped,
    Completed { message_id: String },
    Failed,
}

/// Decodes UTF-8 text from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

pub struct ChatSession {
    thread_id: String,
    run_id: String,
    stream: bool,
    state: TurnState,
    messages: Vec<Message>,
    /// assistant message id -> run id that produced it
    message_runs: HashMap<String, String>,
    upvoted: HashSet<String>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        ChatSession {
            thread_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            stream: true,
            state: TurnState::Composing,
            messages: Vec::new(),
            message_runs: HashMap::new(),
            upvoted: HashSet::new(),
        }
    }

    /// Ask the relay for a single JSON reply instead of incremental text.
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The run id the next turn will be sent with.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, TurnState::Sending | TurnState::Streaming)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn run_for(&self, message_id: &str) -> Option<&str> {
        self.message_runs.get(message_id).map(String::as_str)
    }

    pub fn is_scorable(&self, message_id: &str) -> bool {
        self.message_runs.contains_key(message_id)
    }

    pub fn is_upvoted(&self, message_id: &str) -> bool {
        self.upvoted.contains(message_id)
    }

    /// Whether the upvote control for this message is enabled.
    pub fn can_upvote(&self, message_id: &str) -> bool {
        self.is_scorable(message_id) && !self.is_upvoted(message_id)
    }

    fn set_state(&mut self, state: TurnState, renderer: &mut dyn Renderer) {
        self.state = state;
        renderer.state_changed(state);
    }

    pub async fn submit(
        &mut self,
        input: &str,
        transport: &dyn ChatTransport,
        renderer: &mut dyn Renderer,
    ) -> TurnOutcome {
        if input.trim().is_empty() {
            return TurnOutcome::Skipped;
        }

        self.set_state(TurnState::Sending, renderer);
        let user_message = Message::user(input);
        renderer.message_updated(&user_message);
        self.messages.push(user_message);

        match self.exchange(transport, renderer).await {
            Ok(message_id) => {
                let finished_run =
                    std::mem::replace(&mut self.run_id, Uuid::new_v4().to_string());
                self.message_runs.insert(message_id.clone(), finished_run);
                self.set_state(TurnState::Idle, renderer);
                TurnOutcome::Completed { message_id }
            }
            Err(e) => {
                log::error!("Error sending message: {}", e);
                self.set_state(TurnState::Errored, renderer);
                self.set_state(TurnState::Idle, renderer);
                TurnOutcome::Failed
            }
        }
    }

    async fn exchange(
        &mut self,
        transport: &dyn ChatTransport,
        renderer: &mut dyn Renderer,
    ) -> Result<String, TransportError> {
        let request = ChatReqInput {
            messages: self.messages.clone(),
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            stream: self.stream,
        };
        let mut chunks = transport.send_chat(&request).await?;
        self.set_state(TurnState::Streaming, renderer);

        let assistant_id = Uuid::new_v4().to_string();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            self.append_assistant(&assistant_id, &chunk, renderer);
        }
        // An empty reply still yields an assistant message to score.
        self.append_assistant(&assistant_id, "", renderer);
        Ok(assistant_id)
    }

    fn append_assistant(&mut self, id: &str, chunk: &str, renderer: &mut dyn Renderer) {
        let index = match self.messages.iter().rposition(|m| m.id == id) {
            Some(index) => {
                if chunk.is_empty() {
                    return;
                }
                self.messages[index].content.push_str(chunk);
                index
            }
            None => {
                self.messages.push(Message {
                    id: id.to_string(),
                    role: Role::Assistant,
                    content: chunk.to_string(),
                });
                self.messages.len() - 1
            }
        };
        renderer.message_updated(&self.messages[index]);
    }

    /// Score an assistant message. Returns whether a score was forwarded.
    pub async fn score(
        &mut self,
        message_id: &str,
        upvote: bool,
        transport: &dyn ChatTransport,
    ) -> bool {
        let Some(run_id) = self.message_runs.get(message_id).cloned() else {
            log::debug!("Message {} has no run to score", message_id);
            return false;
        };
        if upvote && self.upvoted.contains(message_id) {
            return false;
        }

        let request = ScoreReqInput {
            run_id,
            score: Judgment::from_upvote(upvote),
        };
        match transport.send_score(&request).await {
            Ok(()) => {
                if upvote {
                    self.upvoted.insert(message_id.to_string());
                }
                true
            }
            Err(e) => {
                log::error!("Error scoring run {}: {}", request.run_id, e);
                false
            }
        }
    }
}

/// Talks to a relay over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        HttpTransport {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

fn is_json(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_chat(&self, request: &ChatReqInput) -> Result<ReplyChunks, TransportError> {
        let resp = self.post("/api/chat", request).await?;

        if is_json(&resp) {
            let bytes = resp.bytes().await?;
            let reply: ChatResponse = serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            return Ok(Box::pin(futures::stream::once(async move {
                Ok::<_, TransportError>(reply.message)
            })));
        }

        let mut decoder = Utf8ChunkDecoder::default();
        let body = resp.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| decoder.decode(&bytes))
                .map_err(TransportError::from)
        });
        Ok(Box::pin(body))
    }

    async fn send_score(&self, request: &ScoreReqInput) -> Result<(), TransportError> {
        self.post("/api/score", request).await?;
        Ok(())
    }
}
