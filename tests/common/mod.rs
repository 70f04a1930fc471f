// Shared by several test binaries; each uses a subset.
#![allow(dead_code)]

pub mod mock_servers;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, web};
use async_trait::async_trait;
use chat_relay::completion::{
    Completion, CompletionClient, CompletionDelta, CompletionRequest, CompletionStream, Usage,
};
use chat_relay::config::RelayConfig;
use chat_relay::error::{CompletionError, TelemetryError};
use chat_relay::relay::RelayState;
use chat_relay::server;
use chat_relay::telemetry::{Score, Step, StepType, TelemetryClient};
use futures::stream;
use std::sync::{Arc, Mutex};

pub const USAGE: Usage = Usage {
    prompt_tokens: 9,
    completion_tokens: 2,
    total_tokens: 11,
};

#[derive(Debug, Clone)]
enum MockReply {
    Chunks(Vec<String>),
    Fail(String),
    BreakAfter(String),
}

/// Completion client double that replays a fixed reply and records requests.
pub struct MockCompletion {
    reply: MockReply,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletion {
    pub fn replying(text: &str) -> Arc<Self> {
        Self::streaming(&[text])
    }

    pub fn streaming(chunks: &[&str]) -> Arc<Self> {
        Self::with(MockReply::Chunks(
            chunks.iter().map(|c| c.to_string()).collect(),
        ))
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Self::with(MockReply::Fail(reason.to_string()))
    }

    /// Streams `chunk`, then fails.
    pub fn breaking_after(chunk: &str) -> Arc<Self> {
        Self::with(MockReply::BreakAfter(chunk.to_string()))
    }

    fn with(reply: MockReply) -> Arc<Self> {
        Arc::new(MockCompletion {
            reply,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

fn failure(reason: &str) -> CompletionError {
    CompletionError::Status {
        status: 503,
        body: reason.to_string(),
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.reply {
            MockReply::Chunks(chunks) => Ok(Completion {
                content: chunks.concat(),
                usage: Some(USAGE),
            }),
            MockReply::Fail(reason) | MockReply::BreakAfter(reason) => Err(failure(reason)),
        }
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, CompletionError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.reply {
            MockReply::Chunks(chunks) => {
                let mut deltas: Vec<Result<CompletionDelta, CompletionError>> = chunks
                    .iter()
                    .map(|c| {
                        Ok(CompletionDelta {
                            content: c.clone(),
                            usage: None,
                        })
                    })
                    .collect();
                deltas.push(Ok(CompletionDelta {
                    content: String::new(),
                    usage: Some(USAGE),
                }));
                Ok(Box::pin(stream::iter(deltas)))
            }
            MockReply::BreakAfter(chunk) => Ok(Box::pin(stream::iter(vec![
                Ok(CompletionDelta {
                    content: chunk.clone(),
                    usage: None,
                }),
                Err(CompletionError::Malformed("connection reset".to_string())),
            ]))),
            MockReply::Fail(reason) => Err(failure(reason)),
        }
    }
}

/// Telemetry client double that keeps everything it is sent.
#[derive(Default)]
pub struct RecordingTelemetry {
    pub steps: Mutex<Vec<Step>>,
    pub scores: Mutex<Vec<Score>>,
    pub threads: Mutex<Vec<(String, Option<String>)>>,
    pub fail: bool,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(RecordingTelemetry {
            fail: true,
            ..Default::default()
        })
    }

    pub fn steps_of(&self, step_type: StepType) -> Vec<Step> {
        self.steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.step_type == step_type)
            .cloned()
            .collect()
    }

    fn check(&self) -> Result<(), TelemetryError> {
        if self.fail {
            return Err(TelemetryError::Status {
                status: 503,
                body: "telemetry unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryClient for RecordingTelemetry {
    async fn get_or_create_participant(&self, identifier: &str) -> Result<String, TelemetryError> {
        self.check()?;
        Ok(format!("participant-{}", identifier))
    }

    async fn upsert_thread(
        &self,
        thread_id: &str,
        participant_id: Option<&str>,
    ) -> Result<(), TelemetryError> {
        self.check()?;
        self.threads
            .lock()
            .unwrap()
            .push((thread_id.to_string(), participant_id.map(str::to_string)));
        Ok(())
    }

    async fn send_steps(&self, steps: &[Step]) -> Result<(), TelemetryError> {
        self.check()?;
        self.steps.lock().unwrap().extend_from_slice(steps);
        Ok(())
    }

    async fn create_score(&self, score: &Score) -> Result<(), TelemetryError> {
        self.check()?;
        self.scores.lock().unwrap().push(score.clone());
        Ok(())
    }
}

pub fn relay_state(
    completion: Arc<dyn CompletionClient>,
    telemetry: Arc<dyn TelemetryClient>,
) -> RelayState {
    RelayState::with_clients(&RelayConfig::default(), completion, telemetry)
}

/// Serve a relay on an ephemeral port. Returns its base URL.
pub fn spawn_relay(state: RelayState) -> (String, ServerHandle) {
    let app_state = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(server::configure)
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .expect("Failed to bind relay");
    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (format!("http://{}", addr), handle)
}
