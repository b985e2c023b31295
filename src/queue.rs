//! Bounded per-user FIFO queue of relay jobs
//!
//! Enforces the backpressure bound at enqueue time and tracks at most one
//! Running job per user. Jobs move forward only: Queued -> Running ->
//! Succeeded | Failed. Terminal jobs stay queryable in a count- and
//! time-bounded retention cache.

use crate::config::{TERMINAL_JOB_CAPACITY, TERMINAL_JOB_TTL_SECS};
use crate::error::{CancelError, EnqueueError};
use crate::session::SessionStore;
use moka::future::Cache;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Status of a relay job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting in the per-user FIFO
    Queued,
    /// Being executed by a relay worker
    Running,
    /// Transfer completed; counters were credited
    Succeeded,
    /// Terminal failure with its reason; no counters credited
    Failed(String),
}

impl JobStatus {
    /// Whether the job can never change state again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// One download-then-upload relay task
#[derive(Debug, Clone)]
pub struct Job {
    /// Process-wide monotonically increasing identifier
    pub job_id: u64,
    /// Owning operator
    pub user_id: i64,
    /// Source locator (link)
    pub source: String,
    /// Destination locator
    pub destination: String,
    /// Current status
    pub status: JobStatus,
}

struct RunningJob {
    job: Job,
    heartbeat: Instant,
}

/// Per-user FIFO queues plus the single running slot per user
pub struct JobQueue {
    store: Arc<SessionStore>,
    max_depth: usize,
    next_id: AtomicU64,
    queued: RwLock<HashMap<i64, VecDeque<Job>>>,
    running: RwLock<HashMap<i64, RunningJob>>,
    finished: Cache<u64, Job>,
}

impl JobQueue {
    /// Create a queue bounded at `max_depth` queued jobs per user
    #[must_use]
    pub fn new(store: Arc<SessionStore>, max_depth: usize) -> Self {
        Self {
            store,
            max_depth,
            next_id: AtomicU64::new(1),
            queued: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
            finished: Cache::builder()
                .max_capacity(TERMINAL_JOB_CAPACITY)
                .time_to_live(Duration::from_secs(TERMINAL_JOB_TTL_SECS))
                .build(),
        }
    }

    /// Enqueue a relay job for an authenticated user.
    ///
    /// Auth is checked here and re-checked at execution time; a session may
    /// be revoked while the job waits.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` if the user has no Active session, `QueueFull`
    /// past the configured bound.
    pub async fn enqueue(
        &self,
        user_id: i64,
        source: String,
        destination: String,
    ) -> Result<u64, EnqueueError> {
        if !self.store.is_active(user_id).await {
            return Err(EnqueueError::NotAuthenticated);
        }

        let mut queued = self.queued.write().await;
        let queue = queued.entry(user_id).or_default();
        if queue.len() >= self.max_depth {
            return Err(EnqueueError::QueueFull(self.max_depth));
        }

        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        queue.push_back(Job {
            job_id,
            user_id,
            source,
            destination,
            status: JobStatus::Queued,
        });
        info!(user_id, job_id, "relay job enqueued");
        Ok(job_id)
    }

    /// Pop the oldest queued job for this user and mark it Running.
    ///
    /// Callers must guarantee at most one outstanding Running job per user;
    /// the worker pool does so by running one task per user.
    pub async fn dequeue_next(&self, user_id: i64) -> Option<Job> {
        let mut queued = self.queued.write().await;
        let mut job = queued.get_mut(&user_id)?.pop_front()?;
        job.status = JobStatus::Running;

        let mut running = self.running.write().await;
        let previous = running.insert(
            user_id,
            RunningJob {
                job: job.clone(),
                heartbeat: Instant::now(),
            },
        );
        debug_assert!(previous.is_none(), "one running job per user");
        Some(job)
    }

    /// Record transfer progress for the user's running job
    pub async fn heartbeat(&self, user_id: i64) {
        let mut running = self.running.write().await;
        if let Some(entry) = running.get_mut(&user_id) {
            entry.heartbeat = Instant::now();
        }
    }

    /// Move the user's running job to a terminal status.
    ///
    /// Returns whether the verdict was recorded. A missing or mismatched
    /// running entry means the supervisor already failed the job as
    /// orphaned; its verdict wins and the late completion is dropped, so
    /// callers must not credit usage for it.
    pub async fn complete(&self, user_id: i64, job_id: u64, status: JobStatus) -> bool {
        debug_assert!(status.is_terminal());
        let entry = {
            let mut running = self.running.write().await;
            match running.get(&user_id) {
                Some(entry) if entry.job.job_id == job_id => running.remove(&user_id),
                _ => None,
            }
        };
        match entry {
            Some(mut entry) => {
                entry.job.status = status;
                self.finished.insert(job_id, entry.job).await;
                true
            }
            None => false,
        }
    }

    /// Cancel a queued job.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the job is Running or terminal, `NotFound` when
    /// no job with this ID is tracked.
    pub async fn cancel(&self, job_id: u64) -> Result<(), CancelError> {
        {
            let mut queued = self.queued.write().await;
            for queue in queued.values_mut() {
                if let Some(pos) = queue.iter().position(|job| job.job_id == job_id) {
                    let mut job = queue
                        .remove(pos)
                        .ok_or(CancelError::NotFound(job_id))?;
                    info!(user_id = job.user_id, job_id, "queued job cancelled");
                    job.status = JobStatus::Failed("cancelled by operator".to_string());
                    self.finished.insert(job_id, job).await;
                    return Ok(());
                }
            }
        }

        let running = self.running.read().await;
        if running.values().any(|entry| entry.job.job_id == job_id) {
            return Err(CancelError::InvalidState(job_id));
        }
        drop(running);

        if self.finished.get(&job_id).await.is_some() {
            return Err(CancelError::InvalidState(job_id));
        }
        Err(CancelError::NotFound(job_id))
    }

    /// Number of queued (not running) jobs for this user
    pub async fn queued_len(&self, user_id: i64) -> usize {
        let queued = self.queued.read().await;
        queued.get(&user_id).map_or(0, VecDeque::len)
    }

    /// Look up the status of any tracked job
    pub async fn status(&self, job_id: u64) -> Option<JobStatus> {
        {
            let queued = self.queued.read().await;
            for queue in queued.values() {
                if queue.iter().any(|job| job.job_id == job_id) {
                    return Some(JobStatus::Queued);
                }
            }
        }
        {
            let running = self.running.read().await;
            if running.values().any(|entry| entry.job.job_id == job_id) {
                return Some(JobStatus::Running);
            }
        }
        self.finished.get(&job_id).await.map(|job| job.status)
    }

    /// Fail every Running job whose worker has not reported progress within
    /// the deadline. Orphaned jobs are never resurrected into Queued.
    ///
    /// Returns the IDs of the jobs that were failed.
    pub async fn fail_orphans(&self, deadline: Duration) -> Vec<u64> {
        let orphans: Vec<RunningJob> = {
            let mut running = self.running.write().await;
            let stale: Vec<i64> = running
                .iter()
                .filter(|(_, entry)| entry.heartbeat.elapsed() >= deadline)
                .map(|(user_id, _)| *user_id)
                .collect();
            stale
                .into_iter()
                .filter_map(|user_id| running.remove(&user_id))
                .collect()
        };

        let mut failed = Vec::with_capacity(orphans.len());
        for mut entry in orphans {
            warn!(
                user_id = entry.job.user_id,
                job_id = entry.job.job_id,
                "running job lost its worker"
            );
            entry.job.status = JobStatus::Failed("worker lost".to_string());
            failed.push(entry.job.job_id);
            self.finished.insert(entry.job.job_id, entry.job).await;
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CredentialHandle, LoginOutcome, MockUserTransport};

    async fn queue_with_active_user(user_id: i64, max_depth: usize) -> JobQueue {
        let mut transport = MockUserTransport::new();
        transport
            .expect_connect()
            .returning(|_, _| Ok(LoginOutcome::Connected(CredentialHandle::new(1))));
        let store = Arc::new(SessionStore::new(Arc::new(transport)));
        store
            .begin_login(user_id, "+79991234567")
            .await
            .expect("login");
        JobQueue::new(store, max_depth)
    }

    fn refs(n: u64) -> (String, String) {
        (
            format!("http://x/{n}.mp4"),
            "http://dest/channel".to_string(),
        )
    }

    #[tokio::test]
    async fn test_enqueue_requires_active_session() {
        let transport = MockUserTransport::new();
        let store = Arc::new(SessionStore::new(Arc::new(transport)));
        let queue = JobQueue::new(store, 4);

        let (source, destination) = refs(1);
        let err = queue
            .enqueue(5, source, destination)
            .await
            .expect_err("no session");
        assert_eq!(err, EnqueueError::NotAuthenticated);
    }

    #[tokio::test]
    async fn test_fifo_order_and_monotonic_ids() {
        let queue = queue_with_active_user(1, 8).await;

        let mut ids = Vec::new();
        for n in 0..3 {
            let (source, destination) = refs(n);
            ids.push(queue.enqueue(1, source, destination).await.expect("enqueue"));
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        for expected in &ids {
            let job = queue.dequeue_next(1).await.expect("job");
            assert_eq!(job.job_id, *expected);
            assert_eq!(job.status, JobStatus::Running);
            assert!(queue.complete(1, job.job_id, JobStatus::Succeeded).await);
        }
        assert!(queue.dequeue_next(1).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_bound_backpressure() {
        let queue = queue_with_active_user(3, 2).await;

        for n in 0..2 {
            let (source, destination) = refs(n);
            queue.enqueue(3, source, destination).await.expect("enqueue");
        }
        let (source, destination) = refs(2);
        let err = queue
            .enqueue(3, source, destination)
            .await
            .expect_err("bound");
        assert_eq!(err, EnqueueError::QueueFull(2));
        assert_eq!(queue.queued_len(3).await, 2);
    }

    #[tokio::test]
    async fn test_cancel_only_queued() {
        let queue = queue_with_active_user(1, 8).await;

        let (source, destination) = refs(1);
        let queued_id = queue.enqueue(1, source, destination).await.expect("enqueue");
        let (source, destination) = refs(2);
        let running_id = queue.enqueue(1, source, destination).await.expect("enqueue");

        // First job goes Running; it can no longer be cancelled.
        let job = queue.dequeue_next(1).await.expect("job");
        assert_eq!(job.job_id, queued_id);
        assert_eq!(
            queue.cancel(queued_id).await,
            Err(CancelError::InvalidState(queued_id))
        );

        // The still-queued one can.
        queue.cancel(running_id).await.expect("cancel queued");
        assert_eq!(
            queue.status(running_id).await,
            Some(JobStatus::Failed("cancelled by operator".to_string()))
        );

        // Terminal jobs refuse cancellation too.
        queue.complete(1, queued_id, JobStatus::Succeeded).await;
        assert_eq!(
            queue.cancel(queued_id).await,
            Err(CancelError::InvalidState(queued_id))
        );

        assert_eq!(queue.cancel(777).await, Err(CancelError::NotFound(777)));
    }

    #[tokio::test]
    async fn test_orphaned_running_job_fails() {
        let queue = queue_with_active_user(1, 8).await;
        let (source, destination) = refs(1);
        let job_id = queue.enqueue(1, source, destination).await.expect("enqueue");
        queue.dequeue_next(1).await.expect("job");

        // A zero deadline treats any running job as past its liveness window.
        let failed = queue.fail_orphans(Duration::ZERO).await;
        assert_eq!(failed, vec![job_id]);
        assert_eq!(
            queue.status(job_id).await,
            Some(JobStatus::Failed("worker lost".to_string()))
        );

        // The worker's late completion is dropped, and the caller is told
        // so it must not credit usage.
        assert!(!queue.complete(1, job_id, JobStatus::Succeeded).await);
        assert_eq!(
            queue.status(job_id).await,
            Some(JobStatus::Failed("worker lost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_status_transitions_forward_only() {
        let queue = queue_with_active_user(1, 8).await;
        let (source, destination) = refs(1);
        let job_id = queue.enqueue(1, source, destination).await.expect("enqueue");
        assert_eq!(queue.status(job_id).await, Some(JobStatus::Queued));

        queue.dequeue_next(1).await.expect("job");
        assert_eq!(queue.status(job_id).await, Some(JobStatus::Running));

        queue
            .complete(1, job_id, JobStatus::Failed("boom".to_string()))
            .await;
        assert!(queue
            .status(job_id)
            .await
            .expect("retained")
            .is_terminal());
    }
}
