//! Process lifetime control
//!
//! Every child spawned by evalkit (agents, build/test workers, serve
//! commands) runs in its own process group so the whole tree can be signalled
//! at once. [`terminate`] escalates SIGTERM → SIGKILL and gives up after twice
//! the grace period instead of hanging forever.

use async_trait::async_trait;
use evalkit_core::{EvalError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, instrument, warn};

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Signal escalation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

/// Something that can be asked to stop and awaited
#[async_trait]
pub trait Terminable: Send {
    /// Whether the process is already gone
    fn has_exited(&mut self) -> bool;

    /// Deliver a signal to the process and its descendants
    fn signal(&mut self, signal: TermSignal) -> Result<()>;

    /// Resolve once the process exits. Must be cancel safe.
    async fn wait_exit(&mut self) -> Result<()>;

    /// Short label for log messages
    fn describe(&self) -> String;
}

/// Stop `process`, escalating to SIGKILL after `grace`.
///
/// Resolves `Ok` as soon as the process exits for any reason. If it is still
/// alive at `2 × grace` a [`EvalError::TerminationTimeout`] is returned.
pub async fn terminate<P>(process: &mut P, grace: Duration) -> Result<()>
where
    P: Terminable + ?Sized,
{
    if process.has_exited() {
        return Ok(());
    }

    debug!("Sending SIGTERM to {}", process.describe());
    if let Err(e) = process.signal(TermSignal::Graceful) {
        warn!("SIGTERM to {} failed: {}", process.describe(), e);
    }

    let escalate = tokio::time::sleep(grace);
    let give_up = tokio::time::sleep(grace * 2);
    tokio::pin!(escalate);
    tokio::pin!(give_up);
    let mut escalated = false;

    loop {
        tokio::select! {
            res = process.wait_exit() => return res,
            _ = &mut escalate, if !escalated => {
                escalated = true;
                warn!(
                    "{} still alive after {:?}, sending SIGKILL",
                    process.describe(),
                    grace
                );
                if let Err(e) = process.signal(TermSignal::Forceful) {
                    warn!("SIGKILL to {} failed: {}", process.describe(), e);
                }
            }
            _ = &mut give_up => {
                return Err(EvalError::TerminationTimeout {
                    grace_ms: grace.as_millis() as u64,
                    detail: process.describe(),
                });
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`
pub fn signal_group(pid: u32, signal: TermSignal) -> Result<()> {
    #[cfg(unix)]
    {
        let sig = match signal {
            TermSignal::Graceful => libc::SIGTERM,
            TermSignal::Forceful => libc::SIGKILL,
        };
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Group already gone
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        Err(EvalError::Unsupported(
            "process-group signals require a unix platform".to_string(),
        ))
    }
}

/// Build a command that becomes the leader of a fresh process group
pub fn group_command(program: impl AsRef<std::ffi::OsStr>, cwd: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// `sh -c <command>` in its own process group
pub fn shell_command(command: &str, cwd: &Path) -> Command {
    let mut cmd = group_command("sh", cwd);
    cmd.arg("-c").arg(command);
    cmd
}

/// A spawned child that owns its process group
#[derive(Debug)]
pub struct ProcessTree {
    child: Child,
    pid: Option<u32>,
    label: String,
}

impl ProcessTree {
    #[instrument(skip(cmd), fields(label = %label))]
    pub fn spawn(mut cmd: Command, label: &str) -> Result<Self> {
        let child = cmd.spawn()?;
        let pid = child.id();
        debug!("Spawned {} (pid {:?})", label, pid);
        Ok(Self {
            child,
            pid,
            label: label.to_string(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for exit and return the exit code, if any
    pub async fn wait_code(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait for {}: {}", self.label, e);
                None
            }
        }
    }

    /// Stop the leader with [`terminate`], then SIGKILL whatever is left in
    /// its process group.
    ///
    /// Children that outlive the leader (backgrounded daemons, watchers) are
    /// killed too, even when the leader had already exited on its own.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let stopped = terminate(self, grace).await;
        if let Some(pid) = self.pid {
            if let Err(e) = signal_group(pid, TermSignal::Forceful) {
                debug!("Sweeping process group of {} failed: {}", self.describe(), e);
            }
        }
        stopped
    }
}

#[async_trait]
impl Terminable for ProcessTree {
    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn signal(&mut self, signal: TermSignal) -> Result<()> {
        match self.pid {
            #[cfg(unix)]
            Some(pid) => signal_group(pid, signal),
            _ => {
                self.child.start_kill()?;
                Ok(())
            }
        }
    }

    async fn wait_exit(&mut self) -> Result<()> {
        self.child.wait().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("{} (pid {})", self.label, pid),
            None => self.label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    /// Fake process that exits on the configured signal
    struct FakeProcess {
        exits_on: Option<TermSignal>,
        exited: bool,
        received: Vec<(TermSignal, Instant)>,
    }

    impl FakeProcess {
        fn new(exits_on: Option<TermSignal>) -> Self {
            Self {
                exits_on,
                exited: false,
                received: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Terminable for FakeProcess {
        fn has_exited(&mut self) -> bool {
            self.exited
        }

        fn signal(&mut self, signal: TermSignal) -> Result<()> {
            self.received.push((signal, Instant::now()));
            if self.exits_on == Some(signal) {
                self.exited = true;
            }
            Ok(())
        }

        async fn wait_exit(&mut self) -> Result<()> {
            while !self.exited {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_exited_sends_nothing() {
        let mut process = FakeProcess::new(None);
        process.exited = true;
        terminate(&mut process, Duration::from_secs(10)).await.unwrap();
        assert!(process.received.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_on_sigterm() {
        let mut process = FakeProcess::new(Some(TermSignal::Graceful));
        let start = Instant::now();
        terminate(&mut process, Duration::from_secs(10)).await.unwrap();

        assert_eq!(process.received.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_to_sigkill_at_grace() {
        let grace = Duration::from_secs(10);
        let mut process = FakeProcess::new(Some(TermSignal::Forceful));
        let start = Instant::now();
        terminate(&mut process, grace).await.unwrap();

        let signals: Vec<_> = process.received.iter().map(|(s, _)| *s).collect();
        assert_eq!(signals, vec![TermSignal::Graceful, TermSignal::Forceful]);
        let escalated_after = process.received[1].1 - start;
        assert!(escalated_after >= grace && escalated_after < grace + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_at_twice_grace() {
        let grace = Duration::from_secs(10);
        let mut process = FakeProcess::new(None);
        let start = Instant::now();
        let err = terminate(&mut process, grace).await.unwrap_err();

        assert!(matches!(err, EvalError::TerminationTimeout { grace_ms: 10_000, .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= grace * 2 && elapsed < grace * 2 + Duration::from_millis(5));
        assert_eq!(process.received.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminates_real_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = shell_command("sleep 30 & sleep 30", dir.path());
        let mut tree = ProcessTree::spawn(cmd, "sleepers").unwrap();
        assert!(!tree.has_exited());

        terminate(&mut tree, Duration::from_secs(2)).await.unwrap();
        assert!(tree.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_children_of_exited_leader() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = shell_command("(sleep 1; touch leaked) & exit 0", dir.path());
        let mut tree = ProcessTree::spawn(cmd, "daemonizer").unwrap();
        assert_eq!(tree.wait_code().await, Some(0));

        tree.shutdown(Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("leaked").exists());
    }
}
