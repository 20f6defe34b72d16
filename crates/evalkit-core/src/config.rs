//! Environment configuration
//!
//! An environment describes how generated apps are built, tested and served,
//! plus the retry budgets and process limits of a run. Loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{EvalError, Result};

/// Package managers that are currently supported
pub const POSSIBLE_PACKAGE_MANAGERS: &[&str] = &["npm", "pnpm", "yarn"];

/// Environment used for every eval of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Human readable name of the environment
    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// Command that builds a generated app
    #[serde(default)]
    pub build_command: String,

    /// Command that runs the app's tests (no tests when absent)
    #[serde(default)]
    pub test_command: Option<String>,

    /// Command that serves the built app
    #[serde(default)]
    pub serve_command: Option<String>,

    /// Package manager agents are allowed to use
    #[serde(default)]
    pub package_manager: String,

    /// Extra instructions handed to every agent
    #[serde(default)]
    pub system_instructions: String,

    /// Maximum repair attempts after a failed build
    #[serde(default = "default_repair_attempts")]
    pub max_build_repair_attempts: usize,

    /// Maximum repair attempts after failed tests
    #[serde(default = "default_repair_attempts")]
    pub max_test_repair_attempts: usize,

    /// Process and concurrency limits
    #[serde(default)]
    pub limits: Limits,
}

/// Process and concurrency limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of build/test processes running at once
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// How long a job may wait for a worker slot
    #[serde(default = "default_admission_timeout_secs")]
    pub admission_timeout_secs: u64,

    /// Safety ceiling for a single test run
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Override for the agent inactivity timeout
    #[serde(default)]
    pub agent_inactivity_timeout_secs: Option<u64>,

    /// Override for the agent total timeout
    #[serde(default)]
    pub agent_total_timeout_secs: Option<u64>,
}

fn default_display_name() -> String {
    "default".to_string()
}

fn default_repair_attempts() -> usize {
    1
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_admission_timeout_secs() -> u64 {
    600
}

fn default_test_timeout_secs() -> u64 {
    4 * 60
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl EnvironmentConfig {
    /// Load and validate an environment from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EvalError::Config(format!("Failed to parse environment file: {}", e)))
    }

    /// Check required fields before any process is spawned
    pub fn validate(&self) -> Result<()> {
        if self.build_command.trim().is_empty() {
            return Err(EvalError::Config(format!(
                "Environment '{}' has no build command",
                self.display_name
            )));
        }

        if self.package_manager.trim().is_empty() {
            return Err(EvalError::Config(format!(
                "Environment '{}' has no package manager",
                self.display_name
            )));
        }

        if !POSSIBLE_PACKAGE_MANAGERS.contains(&self.package_manager.as_str()) {
            return Err(EvalError::Config(format!(
                "Unsupported package manager '{}', expected one of: {}",
                self.package_manager,
                POSSIBLE_PACKAGE_MANAGERS.join(", ")
            )));
        }

        if self.limits.worker_concurrency == 0 {
            return Err(EvalError::Config(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn has_tests(&self) -> bool {
        self.test_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

impl Limits {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            build_command: String::new(),
            test_command: None,
            serve_command: None,
            package_manager: String::new(),
            system_instructions: String::new(),
            max_build_repair_attempts: default_repair_attempts(),
            max_test_repair_attempts: default_repair_attempts(),
            limits: Limits::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            admission_timeout_secs: default_admission_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            agent_inactivity_timeout_secs: None,
            agent_total_timeout_secs: None,
        }
    }
}
