use crate::completion::{
    CompletionClient, CompletionRequest, CompletionStream, OpenAiClient, PromptMessage, Usage,
};
use crate::config::RelayConfig;
use crate::error::{RelayError, TelemetryError};
use crate::io_struct::{ChatReqInput, Role, ScoreReqInput};
use crate::telemetry::{Generation, LiteralClient, NoopTelemetry, Score, Step, TelemetryClient};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const RUN_NAME: &str = "OpenAI Response";

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Shared, immutable state of the relay: the two remote clients plus the
/// sampling settings every turn uses.
#[derive(Clone)]
pub struct RelayState {
    pub completion: Arc<dyn CompletionClient>,
    pub telemetry: Arc<dyn TelemetryClient>,
    pub model: String,
    pub temperature: f64,
    pub participant: String,
}

/// A turn whose run has been opened but not yet completed.
struct Turn {
    request: CompletionRequest,
    run: Step,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()?;
        let completion = Arc::new(OpenAiClient::new(
            client.clone(),
            &config.openai_base_url,
            &config.openai_api_key,
        ));
        let telemetry: Arc<dyn TelemetryClient> = match &config.literal_api_key {
            Some(key) if config.telemetry_enabled() => {
                Arc::new(LiteralClient::new(client, &config.literal_url, key))
            }
            _ => {
                log::warn!("No telemetry API key configured, telemetry is disabled");
                Arc::new(NoopTelemetry)
            }
        };
        Ok(Self::with_clients(config, completion, telemetry))
    }

    pub fn with_clients(
        config: &RelayConfig,
        completion: Arc<dyn CompletionClient>,
        telemetry: Arc<dyn TelemetryClient>,
    ) -> Self {
        RelayState {
            completion,
            telemetry,
            model: config.model.clone(),
            temperature: config.temperature,
            participant: config.participant.clone(),
        }
    }

    /// Relay one turn and return the full completion text.
    pub async fn chat(&self, req: ChatReqInput) -> Result<String, RelayError> {
        let turn = self.open_turn(&req).await?;
        match self.completion.complete(&turn.request).await {
            Ok(completion) => {
                let content = completion.content.clone();
                self.close_turn(turn, completion.content, completion.usage)
                    .await;
                Ok(content)
            }
            Err(e) => {
                self.record_error(&req.thread_id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Relay one turn, forwarding the completion text as it is generated.
    /// The run is recorded once the upstream stream is exhausted.
    pub async fn chat_stream(&self, req: ChatReqInput) -> Result<ReplyStream, RelayError> {
        let turn = self.open_turn(&req).await?;
        let upstream = match self.completion.complete_stream(&turn.request).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.record_error(&req.thread_id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
        let state = self.clone();
        tokio::spawn(state.drain_stream(turn, upstream, tx));

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn drain_stream(
        self,
        turn: Turn,
        mut upstream: CompletionStream,
        tx: mpsc::UnboundedSender<Result<Bytes, io::Error>>,
    ) {
        let mut content = String::new();
        let mut usage = None;
        let mut receiver_connected = true;

        while let Some(delta) = upstream.next().await {
            match delta {
                Ok(delta) => {
                    if delta.usage.is_some() {
                        usage = delta.usage;
                    }
                    if delta.content.is_empty() {
                        continue;
                    }
                    content.push_str(&delta.content);
                    // Keep draining after a disconnect so the run is still recorded.
                    if receiver_connected && tx.send(Ok(Bytes::from(delta.content))).is_err() {
                        log::debug!("Client left run {} before the stream ended", turn.run.id);
                        receiver_connected = false;
                    }
                }
                Err(e) => {
                    log::error!("Completion stream for run {} failed: {}", turn.run.id, e);
                    self.record_error(&turn.run.thread_id, &e.to_string()).await;
                    let _ = tx.send(Err(io::Error::other(e)));
                    return;
                }
            }
        }

        self.close_turn(turn, content, usage).await;
    }

    /// Forward a user judgment on a run.
    pub async fn score(&self, req: &ScoreReqInput) -> Result<(), TelemetryError> {
        let score = Score::user_feedback(&req.run_id, req.score.value());
        self.telemetry.create_score(&score).await
    }

    async fn open_turn(&self, req: &ChatReqInput) -> Result<Turn, RelayError> {
        let user_message = req.user_message().map_err(RelayError::InvalidRequest)?;

        let participant_id = match self
            .telemetry
            .get_or_create_participant(&self.participant)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to resolve participant {}: {}", self.participant, e);
                None
            }
        };
        if let Err(e) = self
            .telemetry
            .upsert_thread(&req.thread_id, participant_id.as_deref())
            .await
        {
            log::warn!("Failed to upsert thread {}: {}", req.thread_id, e);
        }
        self.record(&[Step::user_message(
            &req.thread_id,
            &self.participant,
            &user_message.content,
        )])
        .await;

        let run = Step::run(
            &req.thread_id,
            &req.run_id,
            RUN_NAME,
            json!({ "messages": req.messages }),
        );
        Ok(Turn {
            request: CompletionRequest::new(&self.model, self.temperature, &req.messages),
            run,
        })
    }

    async fn close_turn(&self, turn: Turn, content: String, usage: Option<Usage>) {
        let Turn { request, mut run } = turn;
        let generation = Generation {
            provider: "openai".to_string(),
            model: request.model,
            settings: json!({ "temperature": request.temperature }),
            messages: request.messages,
            message_completion: PromptMessage {
                role: Role::Assistant,
                content: content.clone(),
            },
            input_token_count: None,
            output_token_count: None,
            token_count: None,
        }
        .with_usage(usage);
        let llm = Step::llm(&run, generation);
        run.finish(json!({ "content": content, "usage": usage }));
        self.record(&[run, llm]).await;
    }

    async fn record_error(&self, thread_id: &str, error: &str) {
        self.record(&[Step::error(thread_id, error)]).await;
    }

    /// Telemetry never decides the outcome of a turn.
    async fn record(&self, steps: &[Step]) {
        if let Err(e) = self.telemetry.send_steps(steps).await {
            log::warn!("Failed to record {} telemetry step(s): {}", steps.len(), e);
        }
    }
}
