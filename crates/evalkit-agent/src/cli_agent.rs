//! Runner for vendor CLI agents that edit the working directory in place
//!
//! Agents differ only in binary, flags, instruction files and ignore globs;
//! those live behind [`CliAgent`]. [`CliAgentRunner`] owns everything else:
//! snapshotting, binary resolution, the process race and the transcript.

use async_trait::async_trait;
use evalkit_core::fail_open::fail_open;
use evalkit_core::{EvalError, ResponseFile, Result, Usage};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::process::{group_command, signal_group, ProcessTree, TermSignal};
use crate::runner::{LlmGenerateFilesRequestOptions, LlmGenerateFilesResponse, LlmRunner};
use crate::snapshot::DirectorySnapshot;

/// Globs every agent leaves out of the snapshot
pub const COMMON_IGNORED_PATTERNS: &[&str] = &[
    "**/node_modules/**",
    "**/dist/**",
    "**/.angular/**",
    "**/.git/**",
    "**/.hg/**",
    "**/.svn/**",
];

/// Files rewritten by package managers and the OS rather than by the agent.
/// Agents are also told not to read them.
pub const TOOLING_FILES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "npm-debug.log",
    "yarn-error.log",
    ".DS_Store",
    "Thumbs.db",
];

/// Directories agents are told not to read
pub const COMMON_IGNORED_DIRECTORIES: &[&str] = &[
    "/dist",
    "/tmp",
    "/out-tsc",
    "/bazel-out",
    "/node_modules",
    "/.angular/cache",
    ".sass-cache/",
];

/// Files agents are told not to read, on top of [`TOOLING_FILES`]
pub const COMMON_IGNORED_FILES: &[&str] = &[
    ".editorconfig",
    ".postcssrc.json",
    ".gitignore",
    "pnpm-workspace.yaml",
];

/// Everything an agent is told not to read: [`COMMON_IGNORED_DIRECTORIES`],
/// then [`TOOLING_FILES`] and [`COMMON_IGNORED_FILES`]
pub fn agent_ignore_list() -> Vec<&'static str> {
    COMMON_IGNORED_DIRECTORIES
        .iter()
        .chain(TOOLING_FILES)
        .chain(COMMON_IGNORED_FILES)
        .copied()
        .collect()
}

/// Snapshot ignore globs: the common patterns, every tooling file at any
/// depth, then the agent's own files
pub fn snapshot_ignore_patterns(agent_patterns: &[&str]) -> Vec<String> {
    COMMON_IGNORED_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .chain(TOOLING_FILES.iter().map(|f| format!("**/{}", f)))
        .chain(agent_patterns.iter().map(|p| p.to_string()))
        .collect()
}

const TRANSCRIPT_SEPARATOR: &str = "\n--------------------------------------------------\n";
const READ_CHUNK: usize = 8 * 1024;
/// Bound on draining pipes after exit; background children may hold them open
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Inactivity and absolute limits for one agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimeouts {
    pub inactivity: Duration,
    pub total: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            inactivity: Duration::from_secs(2 * 60),
            total: Duration::from_secs(10 * 60),
        }
    }
}

/// Agent-specific part of a CLI runner
pub trait CliAgent: Send + Sync {
    fn id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    /// Executable name under `node_modules/.bin`
    fn binary_name(&self) -> &'static str;

    /// Instruction and config files the agent writes, excluded from diffs
    fn ignored_file_patterns(&self) -> &'static [&'static str];

    fn supported_models(&self) -> Vec<String>;

    fn command_line_flags(&self, options: &LlmGenerateFilesRequestOptions) -> Result<Vec<String>>;

    /// Write instruction/config files into the working directory
    fn write_agent_files(&self, options: &LlmGenerateFilesRequestOptions) -> Result<()>;

    fn timeouts(&self) -> AgentTimeouts {
        AgentTimeouts::default()
    }
}

/// Rules shared by every agent, followed by the environment's own instructions
pub fn common_instructions(options: &LlmGenerateFilesRequestOptions) -> String {
    let build_command = options.context.build_command.as_deref().unwrap_or_default();
    [
        "# Important Rules".to_string(),
        "The following instructions dictate how you should behave. It is CRITICAL that you follow them AS CLOSELY AS POSSIBLE:".to_string(),
        "- Do NOT attempt to improve the existing code, only implement the user request.".to_string(),
        "- STOP once you've implemented the user request, do NOT try to clean up the project.".to_string(),
        "- You ARE NOT ALLOWED to install dependencies. Assume that all necessary dependencies are already installed.".to_string(),
        "- Do NOT clean up unused files.".to_string(),
        format!("- Do NOT run the dev server, use `{}` to verify the build correctness instead.", build_command),
        "- Do NOT use `git` or any other versioning software.".to_string(),
        "- Do NOT attempt to lint the project.".to_string(),
        String::new(),
        "Following the rules is VERY important and should be done with the utmost care!".to_string(),
        String::new(),
        String::new(),
        options.context.system_instructions.clone(),
    ]
    .join("\n")
}

/// Find `node_modules/.bin/<binary>` under the nearest ancestor of `start`
/// that has a `node_modules` directory.
pub fn resolve_binary_path(start: &Path, binary_name: &str, display_name: &str) -> Result<PathBuf> {
    let root = start.ancestors().find(|dir| dir.join("node_modules").exists());

    match root.map(|r| r.join("node_modules").join(".bin").join(binary_name)) {
        Some(path) if path.exists() => Ok(path),
        _ => Err(EvalError::ToolUnavailable(format!(
            "{} is not installed inside the current project",
            display_name
        ))),
    }
}

/// Why the output race ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Process exited on its own, with its exit code if it has one
    Exited(Option<i32>),
    InactivityTimeout,
    TotalTimeout,
    Cancelled,
}

/// Buffered output of one agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: AgentExit,
}

/// Read both streams until the process exits, a timer fires or the run is
/// cancelled, whichever comes first.
///
/// The inactivity window restarts on every stdout chunk. The absolute deadline
/// never moves.
pub async fn collect_agent_output<O, E, W>(
    mut stdout: O,
    mut stderr: E,
    exit: W,
    timeouts: AgentTimeouts,
    cancel: &CancellationToken,
) -> AgentOutput
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    W: Future<Output = Option<i32>>,
{
    tokio::pin!(exit);
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;

    let inactivity = tokio::time::sleep(timeouts.inactivity);
    let total = tokio::time::sleep(timeouts.total);
    tokio::pin!(inactivity);
    tokio::pin!(total);

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break AgentExit::Cancelled,
            n = stdout.read(&mut out_buf), if stdout_open => match n {
                Ok(0) | Err(_) => stdout_open = false,
                Ok(n) => {
                    out.extend_from_slice(&out_buf[..n]);
                    inactivity.as_mut().reset(Instant::now() + timeouts.inactivity);
                }
            },
            n = stderr.read(&mut err_buf), if stderr_open => match n {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => err.extend_from_slice(&err_buf[..n]),
            },
            code = &mut exit => break AgentExit::Exited(code),
            _ = &mut inactivity => break AgentExit::InactivityTimeout,
            _ = &mut total => break AgentExit::TotalTimeout,
        }
    };

    if matches!(reason, AgentExit::Exited(_)) {
        // Pick up whatever was still in the pipes when the process exited
        let drain = async {
            if stdout_open {
                let _ = stdout.read_to_end(&mut out).await;
            }
            if stderr_open {
                let _ = stderr.read_to_end(&mut err).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Agent pipes still open after exit, dropping the rest");
        }
    }

    AgentOutput {
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        exit: reason,
    }
}

fn describe_minutes(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minute(s)", secs / 60)
    } else {
        format!("{} second(s)", secs)
    }
}

/// Stdout, then stderr (if any), then the status line
pub fn build_transcript(
    display_name: &str,
    output: &AgentOutput,
    timeouts: AgentTimeouts,
) -> String {
    let status = match output.exit {
        AgentExit::Exited(Some(code)) => {
            format!("{} process has exited with {} code.", display_name, code)
        }
        AgentExit::Exited(None) => format!("{} process has exited.", display_name),
        AgentExit::InactivityTimeout => format!(
            "There was no output from {} for {}. Stopping the process...",
            display_name,
            describe_minutes(timeouts.inactivity)
        ),
        AgentExit::TotalTimeout => format!(
            "{} didn't finish within {}. Stopping the process...",
            display_name,
            describe_minutes(timeouts.total)
        ),
        AgentExit::Cancelled => format!("{} run was cancelled. Stopping the process...", display_name),
    };

    let mut transcript = output.stdout.clone();
    if !output.stderr.is_empty() {
        transcript.push_str(TRANSCRIPT_SEPARATOR);
        transcript.push_str("Stderr output:\n");
        transcript.push_str(&output.stderr);
    }
    transcript.push_str(TRANSCRIPT_SEPARATOR);
    transcript.push_str(&status);
    transcript
}

/// [`LlmRunner`] over any [`CliAgent`]
pub struct CliAgentRunner<A: CliAgent> {
    agent: A,
    search_start: Option<PathBuf>,
    binary_path: Mutex<Option<PathBuf>>,
    pending: Mutex<HashSet<u32>>,
    timeouts: Option<AgentTimeouts>,
    kill_grace: Duration,
}

impl<A: CliAgent> CliAgentRunner<A> {
    pub fn new(agent: A) -> Self {
        Self {
            agent,
            search_start: None,
            binary_path: Mutex::new(None),
            pending: Mutex::new(HashSet::new()),
            timeouts: None,
            kill_grace: crate::process::DEFAULT_KILL_GRACE,
        }
    }

    /// Search for `node_modules` upwards from `dir` instead of the executable
    pub fn with_search_start(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_start = Some(dir.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: AgentTimeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    fn effective_timeouts(&self) -> AgentTimeouts {
        self.timeouts.unwrap_or_else(|| self.agent.timeouts())
    }

    fn ignored_patterns(&self) -> Vec<String> {
        snapshot_ignore_patterns(self.agent.ignored_file_patterns())
    }

    fn binary_path(&self) -> Result<PathBuf> {
        let mut cached = self
            .binary_path
            .lock()
            .map_err(|e| EvalError::Internal(format!("binary path lock poisoned: {}", e)))?;
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        let start = match &self.search_start {
            Some(dir) => dir.clone(),
            None => std::env::current_exe()?
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let path = resolve_binary_path(&start, self.agent.binary_name(), self.agent.display_name())?;
        debug!("Resolved {} binary at {}", self.agent.display_name(), path.display());
        *cached = Some(path.clone());
        Ok(path)
    }

    fn track(&self, pid: Option<u32>, register: bool) {
        let Some(pid) = pid else { return };
        if let Ok(mut pending) = self.pending.lock() {
            if register {
                pending.insert(pid);
            } else {
                pending.remove(&pid);
            }
        }
    }

    #[instrument(skip_all, fields(agent = self.agent.id()))]
    async fn run_agent_process(
        &self,
        options: &LlmGenerateFilesRequestOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let binary = self.binary_path()?;
        let flags = self.agent.command_line_flags(options)?;
        let timeouts = self.effective_timeouts();

        let mut cmd = group_command(&binary, &options.context.directory);
        cmd.args(&flags);

        let mut tree = ProcessTree::spawn(cmd, self.agent.display_name())?;
        let (Some(stdout), Some(stderr)) = (tree.take_stdout(), tree.take_stderr()) else {
            return Err(EvalError::Internal("agent stdio was not piped".to_string()));
        };
        self.track(tree.pid(), true);

        let output =
            collect_agent_output(stdout, stderr, tree.wait_code(), timeouts, cancel).await;
        match output.exit {
            AgentExit::Exited(code) => debug!("{} exited with {:?}", self.agent.display_name(), code),
            other => warn!("{} stopped: {:?}", self.agent.display_name(), other),
        }

        let grace = self.kill_grace;
        fail_open("agent teardown", || tree.shutdown(grace)).await;
        self.track(tree.pid(), false);

        Ok(build_transcript(self.agent.display_name(), &output, timeouts))
    }
}

#[async_trait]
impl<A: CliAgent> LlmRunner for CliAgentRunner<A> {
    fn id(&self) -> &str {
        self.agent.id()
    }

    fn display_name(&self) -> &str {
        self.agent.display_name()
    }

    fn has_built_in_repair_loop(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        self.agent.supported_models()
    }

    async fn generate_files(
        &self,
        options: &LlmGenerateFilesRequestOptions,
        cancel: &CancellationToken,
    ) -> Result<LlmGenerateFilesResponse> {
        let context = &options.context;
        if context.build_command.as_deref().map_or(true, str::is_empty) {
            return Err(EvalError::Config(
                "Expected a build command in the generate request context".to_string(),
            ));
        }
        if context.package_manager.as_deref().map_or(true, str::is_empty) {
            return Err(EvalError::Config(
                "Expected a package manager in the generate request context".to_string(),
            ));
        }

        let ignored = self.ignored_patterns();
        let before = DirectorySnapshot::capture_in_background(&context.directory, &ignored).await?;

        self.agent.write_agent_files(options)?;

        info!(
            "Running {} with model {} in {}",
            self.agent.display_name(),
            options.model,
            context.directory.display()
        );
        let reasoning = self.run_agent_process(options, cancel).await?;

        let after = DirectorySnapshot::capture_in_background(&context.directory, &ignored).await?;
        let files = after
            .changed_or_added(&before)
            .into_iter()
            .filter_map(|(path, code)| {
                let rel = path.strip_prefix(&context.directory).ok()?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                Some(ResponseFile::new(rel, code))
            })
            .collect::<Vec<_>>();

        info!("{} changed {} file(s)", self.agent.display_name(), files.len());

        Ok(LlmGenerateFilesResponse {
            files,
            reasoning,
            usage: Usage::default(),
        })
    }

    async fn generate_text(&self, _model: &str, _prompt: &str) -> Result<String> {
        Err(EvalError::Unsupported(format!(
            "Generating text with {} is not supported.",
            self.agent.display_name()
        )))
    }

    async fn generate_constrained(
        &self,
        _model: &str,
        _prompt: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(EvalError::Unsupported(format!(
            "Constrained output with {} is not supported.",
            self.agent.display_name()
        )))
    }

    async fn dispose(&self) -> Result<()> {
        let pids: Vec<u32> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(e) => return Err(EvalError::Internal(format!("process registry poisoned: {}", e))),
        };
        for pid in pids {
            debug!("Killing leftover {} process {}", self.agent.display_name(), pid);
            if let Err(e) = signal_group(pid, TermSignal::Forceful) {
                warn!("Failed to kill process group {}: {}", pid, e);
            }
        }
        Ok(())
    }
}
