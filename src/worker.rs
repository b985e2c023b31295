//! Relay worker pool and orphan supervisor
//!
//! One worker task per user with queued jobs, so at most one job per user
//! is ever Running: the session's connection cannot safely serve two
//! concurrent transfers. Cross-user parallelism is bounded by a semaphore.
//!
//! A transfer streams source chunks to the destination sink, refreshing
//! the job heartbeat at attempt start and at every chunk boundary, and
//! honoring cooperative cancellation there. Transient failures are retried with exponential
//! backoff and jitter up to the configured bound; permanent failures and
//! exhausted retries fail the job with no usage credit. A supervisor loop
//! fails Running jobs whose heartbeat went stale ("worker lost") and never
//! resurrects them into the queue.

use crate::config::RelayConfig;
use crate::error::TransferError;
use crate::ledger::UsageLedger;
use crate::queue::{Job, JobQueue, JobStatus};
use crate::session::SessionStore;
use crate::transport::{CredentialHandle, UserTransport};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct WorkerSlot {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

/// Executes relay jobs, one worker task per user
pub struct WorkerPool {
    store: Arc<SessionStore>,
    queue: Arc<JobQueue>,
    ledger: Arc<UsageLedger>,
    transport: Arc<dyn UserTransport>,
    cfg: RelayConfig,
    limiter: Semaphore,
    workers: Mutex<HashMap<i64, WorkerSlot>>,
    next_generation: AtomicU64,
}

impl WorkerPool {
    /// Create the pool
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        queue: Arc<JobQueue>,
        ledger: Arc<UsageLedger>,
        transport: Arc<dyn UserTransport>,
        cfg: RelayConfig,
    ) -> Arc<Self> {
        let limiter = Semaphore::new(cfg.max_concurrent);
        Arc::new(Self {
            store,
            queue,
            ledger,
            transport,
            cfg,
            limiter,
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Ensure a worker task is draining this user's queue.
    ///
    /// Called after every enqueue. Idempotent while a live worker exists.
    pub async fn notify(self: &Arc<Self>, user_id: i64) {
        let mut workers = self.workers.lock().await;
        if let Some(slot) = workers.get(&user_id) {
            if !slot.handle.is_finished() {
                return;
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let pool = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(pool.run_user(user_id, task_token, generation));
        workers.insert(
            user_id,
            WorkerSlot {
                token,
                handle,
                generation,
            },
        );
    }

    /// Ask this user's running transfer to abort at the next chunk
    /// boundary. Best-effort, not instantaneous.
    pub async fn cancel_user(&self, user_id: i64) {
        let workers = self.workers.lock().await;
        if let Some(slot) = workers.get(&user_id) {
            slot.token.cancel();
        }
    }

    /// Start the orphan supervisor loop
    pub fn spawn_supervisor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let orphaned = pool.queue.fail_orphans(pool.cfg.liveness_deadline).await;
                for job_id in orphaned {
                    warn!(job_id, "supervisor failed orphaned running job");
                }
            }
        })
    }

    // Boxed because the tail re-notify makes this self-referential: the
    // compiler cannot prove an unboxed recursive future is Send.
    fn run_user(
        self: Arc<Self>,
        user_id: i64,
        token: CancellationToken,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            debug!(user_id, "relay worker started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                let Ok(permit) = self.limiter.acquire().await else {
                    break;
                };
                let Some(job) = self.queue.dequeue_next(user_id).await else {
                    drop(permit);
                    // Exit only while the queue is provably empty under the
                    // workers lock, so a concurrent enqueue cannot strand a
                    // job.
                    let mut workers = self.workers.lock().await;
                    if self.queue.queued_len(user_id).await == 0 {
                        if workers
                            .get(&user_id)
                            .is_some_and(|slot| slot.generation == generation)
                        {
                            workers.remove(&user_id);
                        }
                        debug!(user_id, "relay worker idle, exiting");
                        return;
                    }
                    continue;
                };

                let job_id = job.job_id;
                let outcome = self.run_job(&job, &token).await;
                drop(permit);
                match outcome {
                    Ok(bytes) => {
                        // The supervisor may have failed this job as
                        // orphaned in the meantime; usage is credited only
                        // when the success verdict actually lands.
                        if self
                            .queue
                            .complete(user_id, job_id, JobStatus::Succeeded)
                            .await
                        {
                            self.ledger.increment(user_id, 1, bytes).await;
                            info!(user_id, job_id, bytes, "relay job succeeded");
                        } else {
                            warn!(user_id, job_id, "late completion dropped, no usage credited");
                        }
                    }
                    Err(e) => {
                        self.queue
                            .complete(user_id, job_id, JobStatus::Failed(e.to_string()))
                            .await;
                        warn!(user_id, job_id, error = %e, "relay job failed");
                    }
                }
            }

            {
                let mut workers = self.workers.lock().await;
                if workers
                    .get(&user_id)
                    .is_some_and(|slot| slot.generation == generation)
                {
                    workers.remove(&user_id);
                }
            }
            debug!(user_id, "relay worker stopped");
            // Jobs left behind by a cancelled worker still need a verdict
            // (they fail the auth re-check); hand them to a fresh worker.
            if self.queue.queued_len(user_id).await > 0 {
                self.notify(user_id).await;
            }
        })
    }

    /// Execute one job against the user's session.
    ///
    /// The credential handle is checked out of the session for the whole
    /// job, which keeps it exclusive to this worker without blocking
    /// session operations (auth checks, proxy edits, revoke) behind the
    /// transfer.
    async fn run_job(&self, job: &Job, token: &CancellationToken) -> Result<u64, TransferError> {
        // The checkout re-checks auth at execution time; the session may
        // have been revoked while the job waited in the queue.
        let Some(handle) = self.store.checkout_credential(job.user_id).await else {
            return Err(TransferError::SessionUnavailable);
        };

        let base_ms = u64::try_from(self.cfg.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let strategy = ExponentialBackoff::from_millis(base_ms.max(1))
            .max_delay(self.cfg.max_backoff)
            .map(jitter)
            .take(self.cfg.max_attempts.saturating_sub(1));

        let transport = self.transport.as_ref();
        let queue = self.queue.as_ref();
        let attempt_timeout = self.cfg.attempt_timeout;
        let handle_ref = &handle;

        let result = RetryIf::start(
            strategy,
            move || attempt_transfer(transport, handle_ref, job, token, queue, attempt_timeout),
            TransferError::is_transient,
        )
        .await;

        self.store.checkin_credential(job.user_id, handle).await;
        result
    }
}

async fn attempt_transfer(
    transport: &dyn UserTransport,
    handle: &CredentialHandle,
    job: &Job,
    token: &CancellationToken,
    queue: &JobQueue,
    attempt_timeout: Duration,
) -> Result<u64, TransferError> {
    // Waiting on a slow connect or a retry backoff is progress too; the
    // supervisor must not orphan a job whose attempt just started.
    queue.heartbeat(job.user_id).await;
    match timeout(
        attempt_timeout,
        transfer_once(transport, handle, job, token, queue),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(TransferError::Transient(format!(
            "attempt exceeded {}s",
            attempt_timeout.as_secs()
        ))),
    }
}

/// Stream source to destination in bounded chunks, counting bytes.
///
/// Memory use is capped at one chunk regardless of media size.
async fn transfer_once(
    transport: &dyn UserTransport,
    handle: &CredentialHandle,
    job: &Job,
    token: &CancellationToken,
    queue: &JobQueue,
) -> Result<u64, TransferError> {
    let mut source = transport.open_source(handle, &job.source).await?;
    let mut sink = transport.open_sink(handle, &job.destination).await?;

    let mut bytes: u64 = 0;
    while let Some(chunk) = source.next().await {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let chunk = chunk?;
        bytes += chunk.len() as u64;
        sink.write_chunk(chunk).await?;
        queue.heartbeat(job.user_id).await;
    }
    sink.finish().await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoginOutcome, MediaSink, MediaStream, MockUserTransport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        bytes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MediaSink for CountingSink {
        async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), TransferError> {
            self.bytes.fetch_add(chunk.len(), Ordering::Relaxed);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<(), TransferError> {
            Ok(())
        }
    }

    fn chunk_stream(chunks: Vec<&'static [u8]>) -> MediaStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        ))
    }

    fn bare_queue() -> JobQueue {
        let store = Arc::new(SessionStore::new(Arc::new(MockUserTransport::new())));
        JobQueue::new(store, 4)
    }

    fn job(user_id: i64) -> Job {
        Job {
            job_id: 1,
            user_id,
            source: "http://x/a.mp4".to_string(),
            destination: "http://dest/channel".to_string(),
            status: JobStatus::Running,
        }
    }

    #[tokio::test]
    async fn test_transfer_once_counts_bytes() {
        let uploaded = Arc::new(AtomicUsize::new(0));
        let sink_bytes = uploaded.clone();

        let mut transport = MockUserTransport::new();
        transport
            .expect_open_source()
            .returning(|_, _| Ok(chunk_stream(vec![b"abcd".as_slice(), b"efg".as_slice()])));
        transport.expect_open_sink().returning(move |_, _| {
            Ok(Box::new(CountingSink {
                bytes: sink_bytes.clone(),
            }) as Box<dyn MediaSink>)
        });

        let queue = bare_queue();
        let handle = CredentialHandle::new(1);
        let token = CancellationToken::new();

        let bytes = transfer_once(&transport, &handle, &job(1), &token, &queue)
            .await
            .expect("transfer");
        assert_eq!(bytes, 7);
        assert_eq!(uploaded.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn test_transfer_aborts_on_cancellation() {
        let mut transport = MockUserTransport::new();
        transport
            .expect_open_source()
            .returning(|_, _| Ok(chunk_stream(vec![b"abcd".as_slice()])));
        transport.expect_open_sink().returning(|_, _| {
            Ok(Box::new(CountingSink {
                bytes: Arc::new(AtomicUsize::new(0)),
            }) as Box<dyn MediaSink>)
        });

        let queue = bare_queue();
        let handle = CredentialHandle::new(1);
        let token = CancellationToken::new();
        token.cancel();

        let err = transfer_once(&transport, &handle, &job(1), &token, &queue)
            .await
            .expect_err("cancelled");
        assert_eq!(err, TransferError::Cancelled);
    }

    #[tokio::test]
    async fn test_attempt_start_counts_as_progress() {
        let mut transport = MockUserTransport::new();
        transport
            .expect_connect()
            .returning(|_, _| Ok(LoginOutcome::Connected(CredentialHandle::new(1))));
        let store = Arc::new(SessionStore::new(Arc::new(transport)));
        store.begin_login(1, "+79991234567").await.expect("login");
        let queue = Arc::new(JobQueue::new(store, 4));
        queue
            .enqueue(1, "http://x/a.mp4".to_string(), "http://d".to_string())
            .await
            .expect("enqueue");
        queue.dequeue_next(1).await.expect("job");

        // Let the heartbeat written at dequeue time go stale.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let attempt_queue = queue.clone();
        let attempt = tokio::spawn(async move {
            let mut transport = MockUserTransport::new();
            transport.expect_open_source().returning(|_, _| {
                Ok(Box::pin(stream::once(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Bytes::from_static(b"late"))
                })) as MediaStream)
            });
            transport.expect_open_sink().returning(|_, _| {
                Ok(Box::new(CountingSink {
                    bytes: Arc::new(AtomicUsize::new(0)),
                }) as Box<dyn MediaSink>)
            });
            let handle = CredentialHandle::new(1);
            let token = CancellationToken::new();
            let _ = attempt_transfer(
                &transport,
                &handle,
                &job(1),
                &token,
                &attempt_queue,
                Duration::from_secs(10),
            )
            .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A worker waiting on its first byte is alive, not orphaned.
        let failed = queue.fail_orphans(Duration::from_millis(150)).await;
        assert!(failed.is_empty());
        attempt.abort();
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_as_transient() {
        let mut transport = MockUserTransport::new();
        transport.expect_open_source().returning(|_, _| {
            Ok(Box::pin(stream::once(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Bytes::from_static(b"late"))
            })) as MediaStream)
        });
        transport.expect_open_sink().returning(|_, _| {
            Ok(Box::new(CountingSink {
                bytes: Arc::new(AtomicUsize::new(0)),
            }) as Box<dyn MediaSink>)
        });

        let queue = bare_queue();
        let handle = CredentialHandle::new(1);
        let token = CancellationToken::new();

        let err = attempt_transfer(
            &transport,
            &handle,
            &job(1),
            &token,
            &queue,
            Duration::from_millis(20),
        )
        .await
        .expect_err("timeout");
        assert!(err.is_transient());
    }
}
