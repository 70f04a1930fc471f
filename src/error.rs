//! Error types for the remote services the relay and the chat client talk to.

use thiserror::Error;

/// Failures of the hosted chat-completion API.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("completion API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion response: {0}")]
    Malformed(String),
}

/// Failures of the hosted telemetry API.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("telemetry API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("telemetry API rejected {operation}: {message}")]
    Api { operation: String, message: String },
}

/// Why a relay turn produced no reply.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid chat request: {0}")]
    InvalidRequest(&'static str),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// Failures seen by the chat client when calling the relay.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("relay returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed relay response: {0}")]
    Malformed(String),
}
