//! Error types for sandbox command tracking.

use std::fmt;

use thiserror::Error;

/// Failure details reported by a sandbox provider or task dispatcher.
///
/// Providers attach whatever they have: a human message always, and
/// optionally a structured body and/or the raw response text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderError {
    /// Human-readable message.
    pub message: String,
    /// Structured payload (response body, error cause).
    pub json: Option<serde_json::Value>,
    /// Raw response text.
    pub text: Option<String>,
}

impl ProviderError {
    /// Creates a provider error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            json: None,
            text: None,
        }
    }

    /// Attaches a structured payload.
    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json = Some(json);
        self
    }

    /// Attaches raw response text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for ProviderError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Top-level error type for command tracking operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox could not be reached.
    #[error("failed to connect to sandbox: {0}")]
    Connection(ProviderError),

    /// The run/start primitive itself failed. A non-zero exit code is not an error.
    #[error("command execution failed: {0}")]
    Execution(ProviderError),

    /// A read, write or mkdir against the sandbox filesystem failed.
    #[error("sandbox storage failed: {0}")]
    Storage(ProviderError),

    /// The delegated task dispatcher refused or failed the dispatch.
    #[error("task dispatch failed: {0}")]
    Dispatch(ProviderError),

    /// Stored metadata is not valid.
    #[error("invalid command metadata: {0}")]
    Parse(String),

    /// IO error on the host.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the provider payload for errors that carry one.
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            Error::Connection(p) | Error::Execution(p) | Error::Storage(p) | Error::Dispatch(p) => {
                Some(p)
            }
            _ => None,
        }
    }
}

/// Result type alias for command tracking operations.
pub type Result<T> = std::result::Result<T, Error>;
