//! Gemini CLI agent

use evalkit_core::{EvalError, Result};
use serde_json::json;

use crate::cli_agent::{agent_ignore_list, common_instructions, CliAgent};
use crate::runner::{LlmGenerateFilesContext, LlmGenerateFilesRequestOptions};

const SUPPORTED_MODELS: &[&str] = &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.5-flash-lite"];

#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiCli;

impl GeminiCli {
    /// `.geminiignore` content
    pub fn ignore_file() -> String {
        let mut lines = agent_ignore_list();
        lines.push("");
        lines.join("\n")
    }

    /// Tool exclusions keeping the agent away from VCS and dependency changes
    pub fn settings_json(context: &LlmGenerateFilesContext) -> Result<String> {
        let mut exclude = vec!["run_shell_command(git)".to_string()];
        if let Some(pm) = context.package_manager.as_deref() {
            exclude.extend(
                context
                    .possible_package_managers
                    .iter()
                    .filter(|m| m.as_str() != pm)
                    .map(|m| format!("run_shell_command({})", m)),
            );
            for sub in ["install", "add", "remove", "update", "list"] {
                exclude.push(format!("run_shell_command({} {})", pm, sub));
            }
        }

        let settings = json!({
            "excludeTools": exclude,
            "usageStatisticsEnabled": false,
        });
        Ok(serde_json::to_string_pretty(&settings)?)
    }
}

impl CliAgent for GeminiCli {
    fn id(&self) -> &'static str {
        "gemini-cli"
    }

    fn display_name(&self) -> &'static str {
        "Gemini CLI"
    }

    fn binary_name(&self) -> &'static str {
        "gemini"
    }

    fn ignored_file_patterns(&self) -> &'static [&'static str] {
        &["**/GEMINI.md", "**/.geminiignore", "**/.gemini/**"]
    }

    fn supported_models(&self) -> Vec<String> {
        SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn command_line_flags(&self, options: &LlmGenerateFilesRequestOptions) -> Result<Vec<String>> {
        if !SUPPORTED_MODELS.contains(&options.model.as_str()) {
            return Err(EvalError::Config(format!(
                "Model '{}' is not supported by {}",
                options.model,
                self.display_name()
            )));
        }
        Ok(vec![
            "--prompt".to_string(),
            options.context.executable_prompt.clone(),
            "--model".to_string(),
            options.model.clone(),
            "--approval-mode".to_string(),
            "yolo".to_string(),
        ])
    }

    fn write_agent_files(&self, options: &LlmGenerateFilesRequestOptions) -> Result<()> {
        let dir = &options.context.directory;
        let settings_dir = dir.join(".gemini");
        std::fs::create_dir_all(&settings_dir)?;
        std::fs::write(dir.join(".geminiignore"), Self::ignore_file())?;
        std::fs::write(dir.join("GEMINI.md"), common_instructions(options))?;
        std::fs::write(
            settings_dir.join("settings.json"),
            Self::settings_json(&options.context)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_exclude_foreign_package_managers() {
        let context = LlmGenerateFilesContext {
            package_manager: Some("npm".to_string()),
            possible_package_managers: vec!["npm".into(), "yarn".into()],
            ..Default::default()
        };
        let settings: serde_json::Value =
            serde_json::from_str(&GeminiCli::settings_json(&context).unwrap()).unwrap();
        let exclude = settings["excludeTools"].as_array().unwrap();
        assert!(exclude.contains(&json!("run_shell_command(yarn)")));
        assert!(exclude.contains(&json!("run_shell_command(npm install)")));
        assert!(!exclude.contains(&json!("run_shell_command(npm)")));
    }

    #[test]
    fn test_passes_model_through() {
        let options = LlmGenerateFilesRequestOptions {
            model: "gemini-2.5-flash".to_string(),
            ..Default::default()
        };
        let flags = GeminiCli.command_line_flags(&options).unwrap();
        assert_eq!(flags[3], "gemini-2.5-flash");
        assert!(GeminiCli
            .command_line_flags(&LlmGenerateFilesRequestOptions {
                model: "gemini-1.0".to_string(),
                ..Default::default()
            })
            .is_err());
    }
}
