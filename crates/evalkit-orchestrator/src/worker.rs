//! Build and test workers
//!
//! A worker runs one shell command in the eval's directory, in its own process
//! group, and turns the outcome into exactly one typed [`WorkerReply`].

use async_trait::async_trait;
use evalkit_agent::process::{shell_command, ProcessTree};
use evalkit_core::fail_open::fail_open;
use evalkit_core::{
    BuildErrorType, BuildResult, EvalError, Result, TestExecutionResult,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Longest output kept in a build or test message
pub const MAX_OUTPUT_CHARS: usize = 16_000;
/// Bound on reading leftover output once the command has exited
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Build,
    Test,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Build => write!(f, "build"),
            WorkerKind::Test => write!(f, "test"),
        }
    }
}

/// Job handed to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub kind: WorkerKind,
    pub directory: PathBuf,
    pub app_name: String,
    pub command: String,
    /// Hard ceiling for the command, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl WorkerRequest {
    pub fn build(directory: impl Into<PathBuf>, app_name: &str, command: &str) -> Self {
        Self {
            kind: WorkerKind::Build,
            directory: directory.into(),
            app_name: app_name.to_string(),
            command: command.to_string(),
            timeout: None,
        }
    }

    pub fn test(
        directory: impl Into<PathBuf>,
        app_name: &str,
        command: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            kind: WorkerKind::Test,
            directory: directory.into(),
            app_name: app_name.to_string(),
            command: command.to_string(),
            timeout: Some(timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "lowercase")]
pub enum WorkerPayload {
    Build(BuildResult),
    Test(TestExecutionResult),
}

/// The single reply of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub kind: WorkerKind,
    pub payload: WorkerPayload,
}

/// Executes worker jobs
///
/// The pool only cares about admission; how a job runs is up to the executor.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, request: WorkerRequest, cancel: CancellationToken) -> Result<WorkerReply>;
}

/// Runs jobs as `sh -c` child processes
#[derive(Debug, Clone)]
pub struct ProcessJobExecutor {
    kill_grace: Duration,
}

impl ProcessJobExecutor {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Default for ProcessJobExecutor {
    fn default() -> Self {
        Self::new(evalkit_agent::DEFAULT_KILL_GRACE)
    }
}

#[async_trait]
impl JobExecutor for ProcessJobExecutor {
    async fn run(&self, request: WorkerRequest, cancel: CancellationToken) -> Result<WorkerReply> {
        run_worker_job(&request, &cancel, self.kill_grace).await
    }
}

enum JobEnd {
    Finished(Option<i32>),
    TimedOut(Duration),
    Cancelled,
}

/// Append everything `reader` yields to `buf` until EOF.
///
/// Safe to drop midway: bytes read so far stay in `buf`.
async fn read_into<R: AsyncRead + Unpin>(reader: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("Stopped reading worker output: {}", e);
                break;
            }
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Run one build or test command to completion, timeout or cancellation.
///
/// The job ends when the command itself exits; output still held open by
/// background children is drained for at most [`OUTPUT_DRAIN_TIMEOUT`]. The
/// whole process group is killed before returning.
#[instrument(skip(cancel), fields(kind = %request.kind, app = %request.app_name))]
pub async fn run_worker_job(
    request: &WorkerRequest,
    cancel: &CancellationToken,
    kill_grace: Duration,
) -> Result<WorkerReply> {
    let cmd = shell_command(&request.command, &request.directory);
    let mut tree = ProcessTree::spawn(cmd, &format!("{} of {}", request.kind, request.app_name))?;
    let stdout = tree.take_stdout();
    let stderr = tree.take_stderr();
    let mut out = Vec::new();
    let mut err = Vec::new();

    let end = {
        let run = async {
            let reading = async {
                tokio::join!(read_into(stdout, &mut out), read_into(stderr, &mut err));
            };
            tokio::pin!(reading);

            let (code, drained) = tokio::select! {
                code = tree.wait_code() => (code, false),
                _ = &mut reading => (tree.wait_code().await, true),
            };
            if !drained && tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reading).await.is_err() {
                debug!("Output of {} still open after exit, dropping the rest", request.app_name);
            }
            JobEnd::Finished(code)
        };
        tokio::select! {
            end = run => end,
            _ = sleep_or_forever(request.timeout) => {
                JobEnd::TimedOut(request.timeout.unwrap_or_default())
            }
            _ = cancel.cancelled() => JobEnd::Cancelled,
        }
    };

    fail_open("worker teardown", || tree.shutdown(kill_grace)).await;

    let stdout = String::from_utf8_lossy(&out);
    let stderr = String::from_utf8_lossy(&err);

    let payload = match (request.kind, end) {
        (_, JobEnd::Cancelled) => {
            return Err(EvalError::Cancelled(format!(
                "{} of {} was cancelled",
                request.kind, request.app_name
            )))
        }
        (WorkerKind::Build, JobEnd::Finished(code)) => {
            let message = cleanup_build_message(&combine_output(&stdout, &stderr));
            if code == Some(0) {
                WorkerPayload::Build(BuildResult::success(message))
            } else {
                let error_type = classify_build_error(&message);
                WorkerPayload::Build(BuildResult::error(message, Some(error_type)))
            }
        }
        (WorkerKind::Build, JobEnd::TimedOut(limit)) => {
            warn!("Build of {} timed out after {:?}", request.app_name, limit);
            WorkerPayload::Build(BuildResult::error(
                format!("Build timed out after {} second(s)", limit.as_secs()),
                Some(BuildErrorType::Other),
            ))
        }
        (WorkerKind::Test, JobEnd::Finished(code)) => {
            WorkerPayload::Test(TestExecutionResult {
                passed: code == Some(0),
                output: cleanup_build_message(&combine_output(&stdout, &stderr)),
            })
        }
        (WorkerKind::Test, JobEnd::TimedOut(limit)) => {
            warn!("Tests of {} timed out after {:?}", request.app_name, limit);
            WorkerPayload::Test(TestExecutionResult {
                passed: false,
                output: format!("Testing {} timed out after {} second(s)", request.app_name, limit.as_secs()),
            })
        }
    };

    Ok(WorkerReply {
        kind: request.kind,
        payload,
    })
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    [stdout.trim(), stderr.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

fn ansi_regex() -> Option<&'static Regex> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok())
        .as_ref()
}

/// Strip terminal escape codes and cap the length
pub fn cleanup_build_message(message: &str) -> String {
    let clean = match ansi_regex() {
        Some(re) => re.replace_all(message, "").into_owned(),
        None => message.to_string(),
    };
    truncate(clean.trim(), MAX_OUTPUT_CHARS)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...[truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

/// Best-effort classification of a failed build's output
pub fn classify_build_error(message: &str) -> BuildErrorType {
    static PATTERNS: OnceLock<Vec<(Regex, BuildErrorType)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (
                r"Cannot find module|Could not resolve|Module not found|Failed to resolve import",
                BuildErrorType::MissingDependency,
            ),
            (r"\bNG\d{4,5}\b", BuildErrorType::Template),
            (r"\berror TS\d+|\bTS\d{4,5}:", BuildErrorType::TypeScript),
        ]
        .into_iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
        .collect()
    });

    patterns
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, kind)| *kind)
        .unwrap_or(BuildErrorType::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_strips_ansi() {
        let raw = "\x1b[31mERROR\x1b[0m: something broke\n";
        assert_eq!(cleanup_build_message(raw), "ERROR: something broke");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(10);
        assert_eq!(truncate(&long, 3), "ééé...[truncated]");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn test_classify_build_errors() {
        assert_eq!(
            classify_build_error("Error: Cannot find module '@angular/cdk'"),
            BuildErrorType::MissingDependency
        );
        assert_eq!(
            classify_build_error("src/app.ts:3:1 - error TS2304: Cannot find name 'foo'."),
            BuildErrorType::TypeScript
        );
        assert_eq!(
            classify_build_error("error NG8001: 'app-foo' is not a known element"),
            BuildErrorType::Template
        );
        assert_eq!(classify_build_error("segfault"), BuildErrorType::Other);
    }

    #[test]
    fn test_worker_messages_serialize() {
        let reply = WorkerReply {
            kind: WorkerKind::Test,
            payload: WorkerPayload::Test(TestExecutionResult {
                passed: true,
                output: "ok".to_string(),
            }),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["kind"], "test");
        assert_eq!(json["payload"]["type"], "test");
        assert_eq!(json["payload"]["result"]["passed"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let request = WorkerRequest::build(
            dir.path(),
            "todo",
            "echo 'src/main.ts - error TS2322: nope' >&2; exit 1",
        );
        let reply = run_worker_job(&request, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();

        match reply.payload {
            WorkerPayload::Build(result) => {
                assert!(!result.is_success());
                assert_eq!(result.error_type, Some(BuildErrorType::TypeScript));
                assert!(result.message.contains("TS2322"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_child_neither_blocks_nor_outlives_build() {
        let dir = tempfile::tempdir().unwrap();
        let request = WorkerRequest::build(dir.path(), "todo", "(sleep 2; touch leaked) & echo built");

        let start = std::time::Instant::now();
        let reply = run_worker_job(&request, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(
            reply.payload,
            WorkerPayload::Build(BuildResult::success("built"))
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("leaked").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_test_timeout_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = WorkerRequest::test(dir.path(), "todo", "sleep 30", Duration::from_millis(200));
        let reply = run_worker_job(&request, &CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.kind, WorkerKind::Test);
        match reply.payload {
            WorkerPayload::Test(result) => {
                assert!(!result.passed);
                assert!(result.output.contains("timed out"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_job_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = WorkerRequest::build(dir.path(), "todo", "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_worker_job(&request, &cancel, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
