//! Built-in CLI agents

mod claude_code;
mod codex;
mod gemini_cli;

pub use claude_code::ClaudeCode;
pub use codex::Codex;
pub use gemini_cli::GeminiCli;

use evalkit_core::{EvalError, Limits, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::cli_agent::{AgentTimeouts, CliAgent, CliAgentRunner};
use crate::runner::LlmRunner;

/// Identifiers accepted by [`runner_by_name`]
pub const RUNNER_NAMES: &[&str] = &["claude-code", "codex", "gemini-cli"];

/// Build the runner registered under `name`
pub fn runner_by_name(name: &str) -> Result<Arc<dyn LlmRunner>> {
    match name {
        "claude-code" => Ok(Arc::new(CliAgentRunner::new(ClaudeCode))),
        "codex" => Ok(Arc::new(CliAgentRunner::new(Codex))),
        "gemini-cli" => Ok(Arc::new(CliAgentRunner::new(GeminiCli))),
        other => Err(EvalError::Config(format!(
            "Unknown runner '{}'. Available: {}",
            other,
            RUNNER_NAMES.join(", ")
        ))),
    }
}

/// Build the runner registered under `name`, with agent timeouts and the kill
/// grace taken from `limits` where set
pub fn runner_with_limits(name: &str, limits: &Limits) -> Result<Arc<dyn LlmRunner>> {
    match name {
        "claude-code" => Ok(limited(ClaudeCode, limits)),
        "codex" => Ok(limited(Codex, limits)),
        "gemini-cli" => Ok(limited(GeminiCli, limits)),
        other => runner_by_name(other),
    }
}

fn limited<A: CliAgent + 'static>(agent: A, limits: &Limits) -> Arc<dyn LlmRunner> {
    let defaults = agent.timeouts();
    let timeouts = AgentTimeouts {
        inactivity: limits
            .agent_inactivity_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.inactivity),
        total: limits
            .agent_total_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.total),
    };
    Arc::new(
        CliAgentRunner::new(agent)
            .with_timeouts(timeouts)
            .with_kill_grace(limits.kill_grace()),
    )
}

fn map_model(mapping: &[(&str, &'static str)], model: &str, agent: &str) -> Result<&'static str> {
    mapping
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, vendor)| *vendor)
        .ok_or_else(|| {
            EvalError::Config(format!("Model '{}' is not supported by {}", model, agent))
        })
}
