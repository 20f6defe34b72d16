//! Claude Code CLI agent

use evalkit_core::{EvalError, Result};
use serde_json::json;
use std::time::Duration;

use crate::cli_agent::{
    common_instructions, AgentTimeouts, CliAgent, COMMON_IGNORED_DIRECTORIES, COMMON_IGNORED_FILES,
    TOOLING_FILES,
};
use crate::runner::{LlmGenerateFilesContext, LlmGenerateFilesRequestOptions};

const MODEL_MAPPING: &[(&str, &str)] = &[
    ("claude-4.0-sonnet", "claude-sonnet-4-20250514"),
    ("claude-3.5-haiku", "claude-3-5-haiku-latest"),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeCode;

impl ClaudeCode {
    fn vendor_model(model: &str) -> Result<&'static str> {
        super::map_model(MODEL_MAPPING, model, "Claude Code")
    }

    /// Permission rules denying VCS, foreign package managers and dependency changes
    pub fn settings_json(context: &LlmGenerateFilesContext) -> Result<String> {
        let package_manager = context
            .package_manager
            .as_deref()
            .ok_or_else(|| EvalError::Config("package manager is not set".to_string()))?;

        let mut deny = vec!["Bash(git:*)".to_string()];
        deny.extend(
            COMMON_IGNORED_DIRECTORIES
                .iter()
                .map(|dir| format!("Read({}/**)", dir.trim_end_matches('/'))),
        );
        deny.extend(
            TOOLING_FILES
                .iter()
                .chain(COMMON_IGNORED_FILES)
                .map(|file| format!("Read({})", file)),
        );
        deny.extend(
            context
                .possible_package_managers
                .iter()
                .filter(|m| m.as_str() != package_manager)
                .map(|m| format!("Bash({}:*)", m)),
        );
        for sub in ["install", "add", "remove", "update", "list"] {
            deny.push(format!("Bash({} {}:*)", package_manager, sub));
        }

        let settings = json!({
            "permissions": { "deny": deny },
            "env": {
                "DISABLE_AUTOUPDATER": 1,
                "DISABLE_TELEMETRY": 1,
                "DISABLE_ERROR_REPORTING": 1,
            },
        });
        Ok(serde_json::to_string_pretty(&settings)?)
    }
}

impl CliAgent for ClaudeCode {
    fn id(&self) -> &'static str {
        "claude-code"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn binary_name(&self) -> &'static str {
        "claude"
    }

    fn ignored_file_patterns(&self) -> &'static [&'static str] {
        &["**/CLAUDE.md", "**/.claude/**"]
    }

    fn supported_models(&self) -> Vec<String> {
        MODEL_MAPPING.iter().map(|(k, _)| k.to_string()).collect()
    }

    fn command_line_flags(&self, options: &LlmGenerateFilesRequestOptions) -> Result<Vec<String>> {
        Ok(vec![
            "--print".to_string(),
            "--model".to_string(),
            Self::vendor_model(&options.model)?.to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
            "--verbose".to_string(),
            options.context.executable_prompt.clone(),
        ])
    }

    fn write_agent_files(&self, options: &LlmGenerateFilesRequestOptions) -> Result<()> {
        let dir = &options.context.directory;
        let settings_dir = dir.join(".claude");
        std::fs::create_dir_all(&settings_dir)?;
        std::fs::write(
            settings_dir.join("settings.json"),
            Self::settings_json(&options.context)?,
        )?;
        std::fs::write(dir.join("CLAUDE.md"), common_instructions(options))?;
        Ok(())
    }

    fn timeouts(&self) -> AgentTimeouts {
        AgentTimeouts {
            inactivity: Duration::from_secs(10 * 60),
            total: Duration::from_secs(10 * 60),
        }
    }
}
