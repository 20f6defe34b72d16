//! Unified error types for evalkit

use crate::types::Stage;
use thiserror::Error;

/// Unified error type for all eval operations
///
/// Only configuration, tool-availability and repair-request failures are meant
/// to abort an eval. Build and test failures travel as data inside attempts.
#[derive(Error, Debug)]
pub enum EvalError {
    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    ToolUnavailable(String),

    #[error("{0}")]
    Unsupported(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Repair request failed: {0}")]
    RepairRequest(String),

    // Process errors
    #[error("Process did not exit within {grace_ms}ms after escalation: {detail}")]
    TerminationTimeout { grace_ms: u64, detail: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A build or test job that never got a worker
    #[error("Not scheduled: {0}")]
    NotScheduled(String),

    // File errors
    #[error("Invalid path: {0}")]
    PathValidation(String),

    // Internal consistency
    #[error("Internal error: {0}")]
    Internal(String),

    // Context wrapper for fatal errors
    #[error("[{prompt}] {stage} failed: {source}")]
    Stage {
        prompt: String,
        stage: Stage,
        #[source]
        source: Box<EvalError>,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EvalError {
    /// Attach the prompt name and stage to an error.
    ///
    /// Already-wrapped errors are returned untouched so the innermost stage wins.
    pub fn in_stage(self, prompt: impl Into<String>, stage: Stage) -> Self {
        match self {
            wrapped @ EvalError::Stage { .. } => wrapped,
            other => EvalError::Stage {
                prompt: prompt.into(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error must abort the eval instead of being recorded as a stage failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            EvalError::Config(_)
            | EvalError::ToolUnavailable(_)
            | EvalError::Unsupported(_)
            | EvalError::RepairRequest(_)
            | EvalError::Internal(_) => true,
            EvalError::Stage { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Whether the work never started, as opposed to running and failing
    pub fn is_not_scheduled(&self) -> bool {
        match self {
            EvalError::NotScheduled(_) => true,
            EvalError::Stage { source, .. } => source.is_not_scheduled(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            EvalError::Cancelled(_) => true,
            EvalError::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias using EvalError
pub type Result<T> = std::result::Result<T, EvalError>;
