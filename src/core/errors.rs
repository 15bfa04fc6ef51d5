// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the controller.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Transient probe failure: {0}")]
    ProbeTransient(String),

    #[error("Fatal probe failure: {0}")]
    ProbeFatal(String),

    #[error("Role switch timed out for node {id} after {elapsed_secs}s")]
    SwitchTimeout { id: u64, elapsed_secs: u64 },

    #[error("Role switch rejected for node {id}: {reason}")]
    SwitchRejected { id: u64, reason: String },

    #[error("Persistence failure: {0}")]
    PersistFailure(String),

    #[error("Coordinator push failure: {0}")]
    CoordinatorPushFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Maps startup-fatal error kinds to the process exit-code contract:
    /// `1` for configuration errors, `2` for topology validation errors.
    /// Everything else is recoverable and never reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::InvalidConfig(_) => 1,
            ControllerError::InvalidTopology(_) => 2,
            _ => 0,
        }
    }

    /// Transient failures are eligible for retry; fatal ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::ProbeTransient(_)
                | ControllerError::HttpClient(_)
                | ControllerError::CoordinatorPushFailure(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(e: serde_json::Error) -> Self {
        ControllerError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ControllerError::ProbeTransient(e.to_string())
        } else {
            ControllerError::HttpClient(e.to_string())
        }
    }
}
