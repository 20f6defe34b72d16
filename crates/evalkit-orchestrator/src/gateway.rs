//! The seam between orchestration and where work actually runs
//!
//! Everything an eval does outside the driver (code generation, builds, tests,
//! serving) goes through a [`Gateway`]. The driver only holds an
//! `Arc<dyn Gateway>`, so a local backend can be swapped for a remote one
//! without touching the stage logic.

use async_trait::async_trait;
use evalkit_agent::LlmGenerateFilesContext;
use evalkit_core::{
    BuildResult, EnvironmentConfig, EvalId, FileSet, LlmContextFile, LlmResponse, ProgressLogger,
    Result, RootPromptDefinition, ServeTestingResult, TestExecutionResult,
};
use futures::future::BoxFuture;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::pool::WorkerPool;

/// Work done while the app is being served, given the URL it is reachable at
pub type ServeBody = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<ServeTestingResult>> + Send>;

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn initialize_eval(&self) -> Result<EvalId>;

    async fn generate_initial_files(
        &self,
        id: &EvalId,
        ctx: &LlmGenerateFilesContext,
        model: &str,
        context_files: &[LlmContextFile],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse>;

    /// Ask for a fix of `error_message` given the full current file set
    #[allow(clippy::too_many_arguments)]
    async fn repair_code(
        &self,
        id: &EvalId,
        ctx: &LlmGenerateFilesContext,
        model: &str,
        error_message: &str,
        current_files: &FileSet,
        context_files: &[LlmContextFile],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse>;

    #[allow(clippy::too_many_arguments)]
    async fn try_build(
        &self,
        id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        pool: &WorkerPool,
        cancel: &CancellationToken,
        progress: &dyn ProgressLogger,
    ) -> Result<BuildResult>;

    /// `Ok(None)` when the environment has no test command
    #[allow(clippy::too_many_arguments)]
    async fn try_test(
        &self,
        id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        pool: &WorkerPool,
        cancel: &CancellationToken,
        progress: &dyn ProgressLogger,
    ) -> Result<Option<TestExecutionResult>>;

    /// Serve the built app, run `body` against it, then tear the server down
    /// whether or not `body` succeeded.
    #[allow(clippy::too_many_arguments)]
    async fn serve_build(
        &self,
        id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        progress: &dyn ProgressLogger,
        cancel: &CancellationToken,
        body: ServeBody,
    ) -> Result<ServeTestingResult>;

    fn should_retry_failed_builds(&self, id: &EvalId) -> bool;

    fn should_retry_failed_test_execution(&self, id: &EvalId) -> bool;

    /// Release per-eval resources. Calling it twice is harmless.
    async fn finalize_eval(&self, id: &EvalId) -> Result<()>;
}
