use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReqInput {
    pub messages: Vec<Message>,
    pub thread_id: String,
    pub run_id: String,
    #[serde(default)]
    pub stream: bool,
}

impl ChatReqInput {
    /// The message this turn was submitted for.
    pub fn user_message(&self) -> Result<&Message, &'static str> {
        match self.messages.last() {
            None => Err("messages must not be empty"),
            Some(m) if m.role != Role::User => Err("the last message must come from the user"),
            Some(m) => Ok(m),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.into(),
        }
    }
}

/// A user judgment, sent as `0|1` but also accepted as a JSON boolean.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Judgment {
    Flag(bool),
    Value(serde_json::Number),
}

impl Judgment {
    pub fn from_upvote(upvote: bool) -> Self {
        Judgment::Value(serde_json::Number::from(upvote as u8))
    }

    pub fn value(&self) -> f64 {
        match self {
            Judgment::Flag(true) => 1.0,
            Judgment::Flag(false) => 0.0,
            Judgment::Value(v) => v.as_f64().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReqInput {
    pub run_id: String,
    pub score: Judgment,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScoreResponse {
    pub success: bool,
}
