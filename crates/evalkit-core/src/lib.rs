//! # evalkit-core
//!
//! Core types for evaluating code-generation agents.
//!
//! An *eval* drives one prompt against one model through
//! generate → build → test → repair cycles. This crate holds the data model
//! shared by every stage:
//!
//! - Eval identifiers, prompts and the working file set
//! - Attempts with their build, test and serve results
//! - The unified [`EvalError`] type
//! - Environment configuration and the progress-logger seam

mod error;
mod types;

pub mod config;
pub mod fail_open;
pub mod progress;

pub use config::{EnvironmentConfig, Limits, POSSIBLE_PACKAGE_MANAGERS};
pub use error::{EvalError, Result};
pub use progress::{NoopProgressLogger, ProgressLogger, ProgressType, TracingProgressLogger};
pub use types::*;
