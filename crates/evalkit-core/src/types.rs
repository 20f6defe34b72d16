//! Core type definitions for eval orchestration

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{EvalError, Result};

static NEXT_EVAL_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier of one eval run, unique for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvalId(String);

impl EvalId {
    /// Allocate the next process-unique id
    pub fn next() -> Self {
        Self(NEXT_EVAL_ID.fetch_add(1, Ordering::Relaxed).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EvalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage of an eval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Build,
    Test,
    Repair,
    Serve,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
            Self::Repair => write!(f, "repair"),
            Self::Serve => write!(f, "serve"),
        }
    }
}

/// The app to generate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPromptDefinition {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub system_instructions: String,
}

impl RootPromptDefinition {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            system_instructions: String::new(),
        }
    }

    /// Load a prompt from a file; the file stem becomes the prompt name
    pub fn from_file(path: &Path) -> Result<Self> {
        let prompt = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EvalError::Config(format!("Invalid prompt file name: {}", path.display())))?;
        Ok(Self::new(name, prompt))
    }
}

/// One generated file, relative to the project root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFile {
    pub file_path: String,
    pub code: String,
}

impl ResponseFile {
    pub fn new(file_path: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            code: code.into(),
        }
    }
}

/// Extra file handed to an agent as context (not part of the output)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmContextFile {
    pub relative_path: String,
    pub content: String,
}

/// Ordered working file set with at most one entry per path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSet {
    files: Vec<ResponseFile>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a list, later duplicates overwrite earlier ones in place
    pub fn from_files(files: impl IntoIterator<Item = ResponseFile>) -> Self {
        let mut set = Self::new();
        for file in files {
            set.upsert(file);
        }
        set
    }

    /// Overwrite the entry with the same path in place, or append a new one
    pub fn upsert(&mut self, file: ResponseFile) {
        match self.files.iter_mut().find(|f| f.file_path == file.file_path) {
            Some(existing) => existing.code = file.code,
            None => self.files.push(file),
        }
    }

    pub fn get(&self, file_path: &str) -> Option<&ResponseFile> {
        self.files.iter().find(|f| f.file_path == file_path)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResponseFile> {
        self.files.iter()
    }

    pub fn as_slice(&self) -> &[ResponseFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<'a> IntoIterator for &'a FileSet {
    type Item = &'a ResponseFile;
    type IntoIter = std::slice::Iter<'a, ResponseFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Response of a generate or repair request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub output_files: Vec<ResponseFile>,
    pub usage: Usage,
    pub reasoning: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl LlmResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildResultStatus {
    Success,
    Error,
}

/// Coarse classification of a failed build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildErrorType {
    MissingDependency,
    TypeScript,
    Template,
    Other,
}

impl std::fmt::Display for BuildErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDependency => write!(f, "missing dependency"),
            Self::TypeScript => write!(f, "typescript"),
            Self::Template => write!(f, "template"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Violation found by a safety scan of the build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub rule: String,
    pub message: String,
}

/// Outcome of one build invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<BuildErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_violations: Option<Vec<SafetyViolation>>,
}

impl BuildResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: BuildResultStatus::Success,
            message: message.into(),
            error_type: None,
            safety_violations: None,
        }
    }

    pub fn error(message: impl Into<String>, error_type: Option<BuildErrorType>) -> Self {
        Self {
            status: BuildResultStatus::Error,
            message: message.into(),
            error_type,
            safety_violations: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildResultStatus::Success
    }
}

/// Outcome of running the test command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CspViolation {
    pub blocked_uri: String,
    pub violated_directive: String,
}

impl CspViolation {
    /// Trusted Types sink violations are reported separately from plain CSP violations
    pub fn is_trusted_types(&self) -> bool {
        self.blocked_uri == "trusted-types-sink"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxeViolation {
    pub id: String,
    pub impact: Option<String>,
    pub description: String,
}

/// Data collected while the built app was being served
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeTestingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_errors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axe_violations: Option<Vec<AxeViolation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csp_violations: Option<Vec<CspViolation>>,
}

/// One generate-or-repair + build (+ test) pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: usize,
    pub output_files: FileSet,
    pub build_result: BuildResult,
    pub test_result: Option<TestExecutionResult>,
    pub serve_testing_result: Option<ServeTestingResult>,
    pub usage: Usage,
    pub reasoning: String,
}

/// Validate that a response file path stays inside the project root
pub fn validate_relative_path(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);

    if path.as_os_str().is_empty() {
        return Err(EvalError::PathValidation("Empty file path".to_string()));
    }

    if path.is_absolute() {
        return Err(EvalError::PathValidation(format!(
            "Absolute paths not allowed: {}",
            path.display()
        )));
    }

    for component in path.components() {
        if let Component::ParentDir = component {
            return Err(EvalError::PathValidation(format!(
                "Path traversal not allowed: {}",
                path.display()
            )));
        }
    }

    Ok(path.to_path_buf())
}
