//! Bounded worker pool
//!
//! Admission is a FIFO semaphore. Each admitted job runs in its own task and
//! answers over a oneshot channel; the permit travels with the task and is
//! released however the task ends.
//!
//! A job that never got a permit fails with [`PoolError::AdmissionTimeout`],
//! which callers must not confuse with a job that ran and failed.

use evalkit_core::EvalError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::worker::{JobExecutor, ProcessJobExecutor, WorkerRequest, WorkerReply};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Never started: no permit within the admission window
    #[error("no worker became available within {0:?}")]
    AdmissionTimeout(Duration),

    /// Started and failed
    #[error("worker job failed: {0}")]
    Job(String),

    /// Stopped by the eval's cancellation signal
    #[error("worker job cancelled")]
    Cancelled,
}

impl From<PoolError> for EvalError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled => EvalError::Cancelled(err.to_string()),
            PoolError::AdmissionTimeout(_) => EvalError::NotScheduled(err.to_string()),
            other => EvalError::Agent(other.to_string()),
        }
    }
}

/// Fixed-capacity pool for build and test jobs
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    admission_timeout: Duration,
    executor: Arc<dyn JobExecutor>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .field("admission_timeout", &self.admission_timeout)
            .finish()
    }
}

impl WorkerPool {
    /// Pool running jobs as child processes
    pub fn new(capacity: usize, admission_timeout: Duration) -> Self {
        Self::with_executor(
            capacity,
            admission_timeout,
            Arc::new(ProcessJobExecutor::default()),
        )
    }

    pub fn with_executor(
        capacity: usize,
        admission_timeout: Duration,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            admission_timeout,
            executor,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of permits currently held by running jobs
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait for a permit, run `request` on a worker and return its reply
    pub async fn submit(
        &self,
        request: WorkerRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerReply, PoolError> {
        let acquire = tokio::time::timeout(
            self.admission_timeout,
            self.semaphore.clone().acquire_owned(),
        );

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            admitted = acquire => match admitted {
                Err(_) => {
                    warn!(
                        "{} job for {} not admitted within {:?}",
                        request.kind, request.app_name, self.admission_timeout
                    );
                    return Err(PoolError::AdmissionTimeout(self.admission_timeout));
                }
                Ok(Err(_)) => return Err(PoolError::Job("worker pool is closed".to_string())),
                Ok(Ok(permit)) => permit,
            },
        };

        // Dropping `submit` early cancels the job
        let job_cancel = cancel.child_token();
        let _job_guard = job_cancel.clone().drop_guard();

        let (tx, rx) = oneshot::channel();
        let executor = Arc::clone(&self.executor);
        debug!("Starting {} job for {}", request.kind, request.app_name);
        tokio::spawn(async move {
            let _permit = permit;
            let reply = executor.run(request, job_cancel).await;
            let _ = tx.send(reply);
        });

        match rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) if e.is_cancelled() => Err(PoolError::Cancelled),
            Ok(Err(e)) => Err(PoolError::Job(e.to_string())),
            Err(_) => Err(PoolError::Job("worker exited without replying".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerKind, WorkerPayload};
    use async_trait::async_trait;
    use evalkit_core::{BuildResult, Result};
    use tokio::time::Instant;

    /// Sleeps for the number of seconds given as the command
    struct SleepExecutor;

    #[async_trait]
    impl JobExecutor for SleepExecutor {
        async fn run(&self, request: WorkerRequest, cancel: CancellationToken) -> Result<WorkerReply> {
            match request.command.as_str() {
                "fail" => return Err(EvalError::Agent("exploded".to_string())),
                "panic" => panic!("worker crashed"),
                _ => {}
            }
            let secs: u64 = request.command.parse().unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = cancel.cancelled() => return Err(EvalError::Cancelled("stop".to_string())),
            }
            Ok(WorkerReply {
                kind: WorkerKind::Build,
                payload: WorkerPayload::Build(BuildResult::success(request.app_name)),
            })
        }
    }

    fn pool(capacity: usize, admission: Duration) -> WorkerPool {
        WorkerPool::with_executor(capacity, admission, Arc::new(SleepExecutor))
    }

    fn job(command: &str) -> WorkerRequest {
        WorkerRequest::build("/tmp", "app", command)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_job_and_releases_permit() {
        let pool = pool(2, Duration::from_secs(60));
        let reply = pool.submit(job("1"), &CancellationToken::new()).await.unwrap();
        assert_eq!(reply.kind, WorkerKind::Build);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_timeout_is_distinct() {
        let pool = pool(1, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let busy = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.submit(job("100"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.in_flight(), 1);

        let start = Instant::now();
        let err = pool.submit(job("1"), &cancel).await.unwrap_err();
        assert_eq!(err, PoolError::AdmissionTimeout(Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_secs(5));

        assert!(busy.await.unwrap().is_ok());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity() {
        let pool = pool(2, Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { pool.submit(job("10"), &cancel).await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.in_flight(), 2);

        let start = Instant::now();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        // 5 jobs of 10s on 2 workers take three rounds
        assert!(start.elapsed() >= Duration::from_secs(29));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_crash_release_permit() {
        let pool = pool(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let err = pool.submit(job("fail"), &cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Job(msg) if msg.contains("exploded")));
        assert_eq!(pool.in_flight(), 0);

        let err = pool.submit(job("panic"), &cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Job(_)));
        assert_eq!(pool.in_flight(), 0);

        // Capacity is still usable afterwards
        assert!(pool.submit(job("0"), &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_running_job() {
        let pool = pool(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = pool.submit(job("100"), &cancel).await.unwrap_err();
        assert_eq!(err, PoolError::Cancelled);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.in_flight(), 0);
    }
}
