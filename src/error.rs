// src/error.rs

use std::fmt;
use std::io;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Error type for pipeline operations.
///
/// Variants map onto the failure classes the pipeline distinguishes:
/// configuration and rule-compile failures are fatal at startup, transport
/// and store failures are retryable through bus redelivery, evaluation and
/// action failures stay confined to the event or alert that caused them.
#[derive(Debug)]
pub enum SentryError {
    /// IO-related errors
    Io(io::Error),
    /// Startup configuration errors, fatal
    Config(String),
    /// Predicate compile errors, fatal at rule load
    Compile { rule_id: String, diagnostic: String },
    /// Per-event, per-rule evaluation errors
    Eval(String),
    /// Bus I/O failures, retryable via redelivery
    Transport(String),
    /// Correlation or incident store failures, retryable
    Store(String),
    /// Orchestrator mutation rejected, terminal for the action
    Action(String),
    /// Malformed API input
    InvalidInput(String),
    /// Missing API resource
    NotFound(String),
    /// Internal API errors
    Api(String),
}

impl SentryError {
    /// Whether the failed operation should be re-queued rather than dropped.
    pub fn retryable(&self) -> bool {
        matches!(self, SentryError::Transport(_) | SentryError::Store(_))
    }
}

impl fmt::Display for SentryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentryError::Io(e) => write!(f, "IO error: {}", e),
            SentryError::Config(e) => write!(f, "Config error: {}", e),
            SentryError::Compile { rule_id, diagnostic } => {
                write!(f, "rule {} compile error: {}", rule_id, diagnostic)
            }
            SentryError::Eval(e) => write!(f, "Evaluation error: {}", e),
            SentryError::Transport(e) => write!(f, "Transport error: {}", e),
            SentryError::Store(e) => write!(f, "Store error: {}", e),
            SentryError::Action(e) => write!(f, "Action error: {}", e),
            SentryError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            SentryError::NotFound(e) => write!(f, "Not found: {}", e),
            SentryError::Api(e) => write!(f, "API error: {}", e),
        }
    }
}

impl std::error::Error for SentryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SentryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl IntoResponse for SentryError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            SentryError::InvalidInput(e) => (StatusCode::BAD_REQUEST, e.clone()),
            SentryError::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<io::Error> for SentryError {
    fn from(err: io::Error) -> Self {
        SentryError::Io(err)
    }
}

impl From<serde_json::Error> for SentryError {
    fn from(err: serde_json::Error) -> Self {
        SentryError::InvalidInput(format!("JSON error: {}", err))
    }
}

impl From<sled::Error> for SentryError {
    fn from(err: sled::Error) -> Self {
        SentryError::Store(err.to_string())
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, SentryError>;
