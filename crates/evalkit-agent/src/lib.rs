//! # evalkit-agent
//!
//! Runs code-generation agents against a project directory.
//!
//! An agent is a vendor CLI that edits files in place. Its output is recovered
//! by diffing [`DirectorySnapshot`]s taken before and after the run, so the
//! only contract with the agent is the working directory itself.
//!
//! ## Pieces
//!
//! - [`LlmRunner`]: the capability the orchestrator talks to
//! - [`CliAgentRunner`]: generic runner over a [`CliAgent`] strategy
//! - [`process`]: process-group spawning and SIGTERM → SIGKILL teardown
//! - [`agents`]: Claude Code, Codex and Gemini CLI strategies

pub mod agents;
pub mod cli_agent;
pub mod process;
pub mod runner;
pub mod snapshot;

pub use agents::{runner_by_name, runner_with_limits, RUNNER_NAMES};
pub use cli_agent::{
    agent_ignore_list, snapshot_ignore_patterns, AgentTimeouts, CliAgent, CliAgentRunner,
    COMMON_IGNORED_PATTERNS, TOOLING_FILES,
};
pub use process::{terminate, ProcessTree, TermSignal, Terminable, DEFAULT_KILL_GRACE};
pub use runner::{
    LlmGenerateFilesContext, LlmGenerateFilesRequestOptions, LlmGenerateFilesResponse, LlmRunner,
};
pub use snapshot::DirectorySnapshot;
