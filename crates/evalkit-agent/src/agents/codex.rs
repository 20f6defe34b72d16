//! Codex CLI agent

use evalkit_core::Result;

use crate::cli_agent::{common_instructions, CliAgent};
use crate::runner::LlmGenerateFilesRequestOptions;

const MODEL_MAPPING: &[(&str, &str)] = &[
    ("openai-o3", "o3"),
    ("openai-o4-mini", "o4-mini"),
    ("openai-gpt-5", "gpt-5-codex"),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct Codex;

impl CliAgent for Codex {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn display_name(&self) -> &'static str {
        "Codex"
    }

    fn binary_name(&self) -> &'static str {
        "codex"
    }

    fn ignored_file_patterns(&self) -> &'static [&'static str] {
        &["**/AGENTS.md", "**/.codex/**"]
    }

    fn supported_models(&self) -> Vec<String> {
        MODEL_MAPPING.iter().map(|(k, _)| k.to_string()).collect()
    }

    fn command_line_flags(&self, options: &LlmGenerateFilesRequestOptions) -> Result<Vec<String>> {
        let model = super::map_model(MODEL_MAPPING, &options.model, self.display_name())?;
        Ok(vec![
            "exec".to_string(),
            "--model".to_string(),
            model.to_string(),
            "--dangerously-bypass-approvals-and-sandbox".to_string(),
            "--skip-git-repo-check".to_string(),
            options.context.executable_prompt.clone(),
        ])
    }

    fn write_agent_files(&self, options: &LlmGenerateFilesRequestOptions) -> Result<()> {
        let dir = &options.context.directory;
        let settings_dir = dir.join(".codex");
        std::fs::create_dir_all(&settings_dir)?;
        std::fs::write(settings_dir.join("config.toml"), "hide_agent_reasoning = true\n")?;
        std::fs::write(dir.join("AGENTS.md"), common_instructions(options))?;
        Ok(())
    }
}
