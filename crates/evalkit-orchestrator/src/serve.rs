//! Serving a built app for runtime checks
//!
//! The serve command is started in its own process group and its output is
//! watched for the first local URL. Whatever happens afterwards, the server is
//! torn down before [`serve_app`] returns.

use evalkit_agent::process::{shell_command, ProcessTree};
use evalkit_core::fail_open::fail_open;
use evalkit_core::{
    EvalError, ProgressLogger, ProgressType, Result, RootPromptDefinition, ServeTestingResult,
};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::gateway::ServeBody;
use crate::worker::cleanup_build_message;

/// How long the serve command gets to print its URL
pub const DEFAULT_SERVE_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Limits for one serve run
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub startup_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_SERVE_STARTUP_TIMEOUT,
            kill_grace: evalkit_agent::DEFAULT_KILL_GRACE,
        }
    }
}

fn url_regex() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://(?:localhost|127\.0\.0\.1)(?::\d+)?[^\s]*").ok())
        .as_ref()
}

/// First `localhost` / `127.0.0.1` URL in a line of server output
pub fn find_local_url(line: &str) -> Option<String> {
    let clean = cleanup_build_message(line);
    url_regex()?
        .find(&clean)
        .map(|m| m.as_str().to_string())
}

fn forward_lines<R>(reader: Option<R>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Start `command` in `dir`, wait for its URL and run `body` against it
#[instrument(skip(prompt, progress, cancel, body), fields(app = %prompt.name))]
pub async fn serve_app(
    command: &str,
    dir: &Path,
    prompt: &RootPromptDefinition,
    progress: &dyn ProgressLogger,
    cancel: &CancellationToken,
    options: ServeOptions,
    body: ServeBody,
) -> Result<ServeTestingResult> {
    progress.log(prompt, ProgressType::ServeTesting, "Starting the app server", None);

    let mut tree = ProcessTree::spawn(shell_command(command, dir), &format!("serve {}", prompt.name))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    forward_lines(tree.take_stdout(), tx.clone());
    forward_lines(tree.take_stderr(), tx);

    let result = async {
        let mut seen = Vec::new();
        let wait_for_url = async {
            while let Some(line) = rx.recv().await {
                debug!("serve: {}", line);
                if let Some(url) = find_local_url(&line) {
                    return Some(url);
                }
                seen.push(line);
            }
            None
        };

        let url = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EvalError::Cancelled(format!("serving {} was cancelled", prompt.name)));
            }
            found = tokio::time::timeout(options.startup_timeout, wait_for_url) => match found {
                Ok(Some(url)) => url,
                Ok(None) => {
                    return Err(EvalError::Agent(format!(
                        "Serve command exited before printing a URL:\n{}",
                        seen.join("\n")
                    )));
                }
                Err(_) => {
                    return Err(EvalError::Agent(format!(
                        "Serve command did not print a URL within {} second(s)",
                        options.startup_timeout.as_secs()
                    )));
                }
            },
        };

        info!("{} is being served at {}", prompt.name, url);
        progress.log(prompt, ProgressType::ServeTesting, "Testing the served app", Some(&url));

        tokio::select! {
            _ = cancel.cancelled() => {
                Err(EvalError::Cancelled(format!("serving {} was cancelled", prompt.name)))
            }
            res = body(url) => res,
        }
    }
    .await;

    let grace = options.kill_grace;
    fail_open("serve teardown", || tree.shutdown(grace)).await;

    result
}

/// Default serve body: one GET of the root page
pub fn probe_body() -> ServeBody {
    Box::new(|url| Box::pin(probe_url(url)))
}

/// Fetch `url` and report a non-success status or transport error as a runtime error
pub async fn probe_url(url: String) -> Result<ServeTestingResult> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| EvalError::Internal(format!("Failed to build HTTP client: {}", e)))?;

    let runtime_errors = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => None,
        Ok(response) => Some(format!("GET {} returned {}", url, response.status())),
        Err(e) => Some(format!("GET {} failed: {}", url, e)),
    };

    Ok(ServeTestingResult {
        runtime_errors,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalkit_core::NoopProgressLogger;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_find_local_url() {
        assert_eq!(
            find_local_url("  ➜  Local:   \x1b[36mhttp://localhost:4200/\x1b[0m"),
            Some("http://localhost:4200/".to_string())
        );
        assert_eq!(
            find_local_url("Listening on http://127.0.0.1:8080"),
            Some("http://127.0.0.1:8080".to_string())
        );
        assert_eq!(find_local_url("Network: http://192.168.1.4:4200/"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_body_receives_url_and_server_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = RootPromptDefinition::new("todo", "make a todo app");
        let seen_url = Arc::new(std::sync::Mutex::new(String::new()));
        let captured = Arc::clone(&seen_url);

        let body: ServeBody = Box::new(move |url| {
            Box::pin(async move {
                *captured.lock().unwrap() = url;
                Ok(ServeTestingResult::default())
            })
        });

        let result = serve_app(
            "echo starting; echo 'Local: http://localhost:4321/'; sleep 30",
            dir.path(),
            &prompt,
            &NoopProgressLogger,
            &CancellationToken::new(),
            ServeOptions {
                startup_timeout: Duration::from_secs(10),
                kill_grace: Duration::from_secs(2),
            },
            body,
        )
        .await
        .unwrap();

        assert_eq!(result, ServeTestingResult::default());
        assert_eq!(*seen_url.lock().unwrap(), "http://localhost:4321/");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_teardown_happens_when_body_fails() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let prompt = RootPromptDefinition::new("todo", "make a todo app");
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_body = Arc::clone(&ran);

        let body: ServeBody = Box::new(move |_url| {
            Box::pin(async move {
                ran_in_body.store(true, Ordering::SeqCst);
                Err(EvalError::Agent("probe blew up".to_string()))
            })
        });

        let command = format!(
            "trap 'touch {}; exit 0' TERM; echo http://127.0.0.1:9999; while true; do sleep 0.1; done",
            marker.display()
        );
        let err = serve_app(
            &command,
            dir.path(),
            &prompt,
            &NoopProgressLogger,
            &CancellationToken::new(),
            ServeOptions {
                startup_timeout: Duration::from_secs(10),
                kill_grace: Duration::from_secs(2),
            },
            body,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("probe blew up"));
        assert!(ran.load(Ordering::SeqCst));
        assert!(marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_without_url_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = RootPromptDefinition::new("todo", "make a todo app");
        let err = serve_app(
            "echo 'port in use'",
            dir.path(),
            &prompt,
            &NoopProgressLogger,
            &CancellationToken::new(),
            ServeOptions::default(),
            probe_body(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("port in use"));
    }

    #[tokio::test]
    async fn test_probe_reports_server_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let result = probe_url(format!("http://{}/", addr)).await.unwrap();
        assert!(result.runtime_errors.unwrap().contains("500"));
    }
}
