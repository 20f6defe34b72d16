//! The runner capability every code-generation backend implements

use async_trait::async_trait;
use evalkit_core::{LlmContextFile, ResponseFile, Result, Usage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// What the runner needs to know about the project it edits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmGenerateFilesContext {
    /// Working directory of the eval
    pub directory: PathBuf,
    pub system_instructions: String,
    /// Prompt handed to the model
    pub executable_prompt: String,
    pub build_command: Option<String>,
    pub package_manager: Option<String>,
    pub possible_package_managers: Vec<String>,
}

/// One `generate_files` request
#[derive(Debug, Clone, Default)]
pub struct LlmGenerateFilesRequestOptions {
    pub context: LlmGenerateFilesContext,
    pub model: String,
    pub context_files: Vec<LlmContextFile>,
}

/// Files produced by one runner invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmGenerateFilesResponse {
    /// Paths relative to the working directory
    pub files: Vec<ResponseFile>,
    /// Transcript of the run
    pub reasoning: String,
    pub usage: Usage,
}

/// A code-generation backend
#[async_trait]
pub trait LlmRunner: Send + Sync {
    /// Stable identifier, e.g. `claude-code`
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Whether the backend fixes build errors on its own.
    ///
    /// When true the orchestrator never schedules repair attempts.
    fn has_built_in_repair_loop(&self) -> bool;

    fn supported_models(&self) -> Vec<String>;

    async fn generate_files(
        &self,
        options: &LlmGenerateFilesRequestOptions,
        cancel: &CancellationToken,
    ) -> Result<LlmGenerateFilesResponse>;

    async fn generate_text(&self, model: &str, prompt: &str) -> Result<String>;

    async fn generate_constrained(
        &self,
        model: &str,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Release everything the runner still holds (processes, sessions)
    async fn dispose(&self) -> Result<()>;
}
