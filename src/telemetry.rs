//! Conversation telemetry: participants, threads, steps, runs and scores.
//!
//! [`LiteralClient`] ships records to a Literal-compatible GraphQL API;
//! [`NoopTelemetry`] stands in when no telemetry key is configured.

use crate::completion::{PromptMessage, Usage};
use crate::error::TelemetryError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    UserMessage,
    SystemMessage,
    Run,
    Llm,
}

/// Details of one call to the completion API, attached to `llm` steps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub provider: String,
    pub model: String,
    pub settings: Value,
    pub messages: Vec<PromptMessage>,
    pub message_completion: PromptMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl Generation {
    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        if let Some(usage) = usage {
            self.input_token_count = Some(usage.prompt_tokens);
            self.output_token_count = Some(usage.completion_tokens);
            self.token_count = Some(usage.total_tokens);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
}

impl Step {
    pub fn new(thread_id: &str, step_type: StepType, name: &str) -> Self {
        Step {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            parent_id: None,
            step_type,
            name: name.to_string(),
            input: None,
            output: None,
            start_time: timestamp(),
            end_time: None,
            generation: None,
        }
    }

    pub fn user_message(thread_id: &str, participant: &str, content: &str) -> Self {
        let mut step = Step::new(thread_id, StepType::UserMessage, participant);
        step.output = Some(json!({ "content": content }));
        step.end_time = Some(step.start_time.clone());
        step
    }

    pub fn error(thread_id: &str, error: &str) -> Self {
        let mut step = Step::new(thread_id, StepType::SystemMessage, "Error Processing Request");
        step.output = Some(json!({ "error": error }));
        step.end_time = Some(step.start_time.clone());
        step
    }

    /// A run keeps the caller-provided id so scores can later target it.
    pub fn run(thread_id: &str, run_id: &str, name: &str, input: Value) -> Self {
        let mut step = Step::new(thread_id, StepType::Run, name);
        step.id = run_id.to_string();
        step.input = Some(input);
        step
    }

    pub fn llm(run: &Step, generation: Generation) -> Self {
        let mut step = Step::new(&run.thread_id, StepType::Llm, &generation.model);
        step.parent_id = Some(run.id.clone());
        step.start_time = run.start_time.clone();
        step.output = Some(json!({ "content": generation.message_completion.content }));
        step.generation = Some(generation);
        step.end_time = Some(timestamp());
        step
    }

    pub fn finish(&mut self, output: Value) {
        self.output = Some(output);
        self.end_time = Some(timestamp());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoreType {
    Human,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub name: String,
    #[serde(rename = "type")]
    pub score_type: ScoreType,
    pub value: f64,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Score {
    pub fn user_feedback(run_id: &str, value: f64) -> Self {
        Score {
            name: "user-feedback".to_string(),
            score_type: ScoreType::Human,
            value,
            step_id: run_id.to_string(),
            comment: None,
        }
    }
}

#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// Resolve the telemetry id for a participant identifier, creating it if needed.
    async fn get_or_create_participant(&self, identifier: &str) -> Result<String, TelemetryError>;

    async fn upsert_thread(
        &self,
        thread_id: &str,
        participant_id: Option<&str>,
    ) -> Result<(), TelemetryError>;

    async fn send_steps(&self, steps: &[Step]) -> Result<(), TelemetryError>;

    async fn create_score(&self, score: &Score) -> Result<(), TelemetryError>;
}

/// Telemetry sink used when no API key is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetryClient for NoopTelemetry {
    async fn get_or_create_participant(&self, identifier: &str) -> Result<String, TelemetryError> {
        Ok(identifier.to_string())
    }

    async fn upsert_thread(&self, _: &str, _: Option<&str>) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn send_steps(&self, steps: &[Step]) -> Result<(), TelemetryError> {
        log::debug!("Telemetry disabled, dropping {} step(s)", steps.len());
        Ok(())
    }

    async fn create_score(&self, score: &Score) -> Result<(), TelemetryError> {
        log::debug!("Telemetry disabled, dropping score for {}", score.step_id);
        Ok(())
    }
}

const PARTICIPANT_QUERY: &str = r#"query GetParticipant($identifier: String!) {
  participant(identifier: $identifier) { id }
}"#;

const CREATE_PARTICIPANT: &str = r#"mutation CreateParticipant($identifier: String!) {
  createParticipant(identifier: $identifier) { id }
}"#;

const UPSERT_THREAD: &str = r#"mutation UpsertThread($id: String!, $participantId: String) {
  upsertThread(id: $id, participantId: $participantId) { id }
}"#;

const INGEST_STEPS: &str = r#"mutation IngestSteps($steps: [StepInput!]!) {
  ingestSteps(steps: $steps) { ok message }
}"#;

const CREATE_SCORE: &str = r#"mutation CreateScore($name: String!, $type: ScoreType!, $value: Float!, $stepId: String, $comment: String) {
  createScore(name: $name, type: $type, value: $value, stepId: $stepId, comment: $comment) { id }
}"#;

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct LiteralClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl LiteralClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        LiteralClient {
            client,
            url: format!("{}/api/graphql", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        }
    }

    async fn execute(
        &self,
        operation: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value, TelemetryError> {
        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "operationName": operation,
                "query": query,
                "variables": variables,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TelemetryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: GraphQlResponse = resp.json().await?;
        if let Some(err) = body.errors.into_iter().next() {
            return Err(TelemetryError::Api {
                operation: operation.to_string(),
                message: err.message,
            });
        }
        Ok(body.data.unwrap_or(Value::Null))
    }
}

fn participant_id(data: &Value, field: &str) -> Option<String> {
    data.get(field)?.get("id")?.as_str().map(str::to_string)
}

#[async_trait]
impl TelemetryClient for LiteralClient {
    async fn get_or_create_participant(&self, identifier: &str) -> Result<String, TelemetryError> {
        let variables = json!({ "identifier": identifier });
        let data = self
            .execute("GetParticipant", PARTICIPANT_QUERY, variables.clone())
            .await?;
        if let Some(id) = participant_id(&data, "participant") {
            return Ok(id);
        }
        let data = self
            .execute("CreateParticipant", CREATE_PARTICIPANT, variables)
            .await?;
        participant_id(&data, "createParticipant").ok_or_else(|| TelemetryError::Api {
            operation: "CreateParticipant".to_string(),
            message: "response carried no participant id".to_string(),
        })
    }

    async fn upsert_thread(
        &self,
        thread_id: &str,
        participant_id: Option<&str>,
    ) -> Result<(), TelemetryError> {
        self.execute(
            "UpsertThread",
            UPSERT_THREAD,
            json!({ "id": thread_id, "participantId": participant_id }),
        )
        .await?;
        Ok(())
    }

    async fn send_steps(&self, steps: &[Step]) -> Result<(), TelemetryError> {
        let data = self
            .execute("IngestSteps", INGEST_STEPS, json!({ "steps": steps }))
            .await?;
        let result = &data["ingestSteps"];
        if result["ok"].as_bool() == Some(false) {
            return Err(TelemetryError::Api {
                operation: "IngestSteps".to_string(),
                message: result["message"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(())
    }

    async fn create_score(&self, score: &Score) -> Result<(), TelemetryError> {
        self.execute("CreateScore", CREATE_SCORE, serde_json::to_value(score).unwrap_or_default())
            .await?;
        Ok(())
    }
}
