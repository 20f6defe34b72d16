//! Progress reporting seam
//!
//! The orchestrator reports every stage transition through a [`ProgressLogger`].
//! Rich terminal displays live outside this workspace; the loggers here either
//! forward to `tracing` or drop events.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

use crate::RootPromptDefinition;

/// Possible progress event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressType {
    Codegen,
    Build,
    Test,
    ServeTesting,
    Success,
    Error,
    Eval,
}

impl ProgressType {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressType::Codegen => "codegen",
            ProgressType::Build => "build",
            ProgressType::Test => "test",
            ProgressType::ServeTesting => "serve-testing",
            ProgressType::Success => "success",
            ProgressType::Error => "error",
            ProgressType::Eval => "eval",
        }
    }
}

/// Receives progress events of a run
pub trait ProgressLogger: Send + Sync {
    /// Start of a run with `total` prompts
    fn initialize(&self, total: usize);

    /// End of a run
    fn finalize(&self);

    /// One prompt has finished all its stages
    fn eval_finished(&self, prompt: &RootPromptDefinition);

    fn log(
        &self,
        prompt: &RootPromptDefinition,
        kind: ProgressType,
        message: &str,
        details: Option<&str>,
    );
}

/// Forwards progress events to `tracing`
#[derive(Debug, Default)]
pub struct TracingProgressLogger {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl TracingProgressLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressLogger for TracingProgressLogger {
    fn initialize(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    fn finalize(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    fn eval_finished(&self, prompt: &RootPromptDefinition) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[{}] Done ({}/{})",
            prompt.name,
            done,
            self.total.load(Ordering::Relaxed)
        );
    }

    fn log(
        &self,
        prompt: &RootPromptDefinition,
        kind: ProgressType,
        message: &str,
        details: Option<&str>,
    ) {
        let details = details.unwrap_or("");
        match kind {
            ProgressType::Error => {
                error!(stage = kind.label(), "[{}] {} {}", prompt.name, message, details)
            }
            _ => info!(stage = kind.label(), "[{}] {} {}", prompt.name, message, details),
        }
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressLogger;

impl ProgressLogger for NoopProgressLogger {
    fn initialize(&self, _total: usize) {}

    fn finalize(&self) {}

    fn eval_finished(&self, _prompt: &RootPromptDefinition) {}

    fn log(
        &self,
        _prompt: &RootPromptDefinition,
        _kind: ProgressType,
        _message: &str,
        _details: Option<&str>,
    ) {
    }
}
