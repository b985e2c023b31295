//! Session-and-job coordinator facade
//!
//! Bundles the session store, job queue, usage ledger, and worker pool
//! behind the typed call contract the command layer uses. The command
//! layer stays a thin adapter; every business rule lives behind this
//! facade.

use crate::config::RelayConfig;
use crate::error::{CancelError, EnqueueError, SessionError};
use crate::ledger::{UsageCounters, UsageLedger};
use crate::queue::{JobQueue, JobStatus};
use crate::session::{LoginResult, SessionStore};
use crate::transport::UserTransport;
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The coordinator: one instance serves every operator
pub struct RelayCoordinator {
    store: Arc<SessionStore>,
    queue: Arc<JobQueue>,
    ledger: Arc<UsageLedger>,
    pool: Arc<WorkerPool>,
}

impl RelayCoordinator {
    /// Wire up the coordinator on top of a transport
    #[must_use]
    pub fn new(
        transport: Arc<dyn UserTransport>,
        relay: RelayConfig,
        max_queue_depth: usize,
    ) -> Arc<Self> {
        let store = Arc::new(SessionStore::new(transport.clone()));
        let queue = Arc::new(JobQueue::new(store.clone(), max_queue_depth));
        let ledger = Arc::new(UsageLedger::new());
        let pool = WorkerPool::new(
            store.clone(),
            queue.clone(),
            ledger.clone(),
            transport,
            relay,
        );
        Arc::new(Self {
            store,
            queue,
            ledger,
            pool,
        })
    }

    /// Start the orphan supervisor; the returned handle runs for the
    /// process lifetime.
    pub fn start_supervisor(&self, interval: Duration) -> JoinHandle<()> {
        self.pool.spawn_supervisor(interval)
    }

    /// Begin authentication for an operator
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the session store.
    pub async fn begin_login(
        &self,
        user_id: i64,
        phone_number: &str,
    ) -> Result<LoginResult, SessionError> {
        self.store.begin_login(user_id, phone_number).await
    }

    /// Forward the second-factor code for a pending login
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the session store.
    pub async fn complete_login(&self, user_id: i64, code: &str) -> Result<(), SessionError> {
        self.store.complete_login(user_id, code).await
    }

    /// Bind a proxy for future connection attempts
    pub async fn bind_proxy(&self, user_id: i64, address: String) {
        self.store.bind_proxy(user_id, address).await;
    }

    /// Remove the operator's proxy binding
    pub async fn clear_proxy(&self, user_id: i64) {
        self.store.clear_proxy(user_id).await;
    }

    /// Log the operator out: ask any running transfer to abort, then
    /// release the credential. Idempotent.
    pub async fn revoke(&self, user_id: i64) {
        self.pool.cancel_user(user_id).await;
        self.store.revoke(user_id).await;
    }

    /// Whether the operator holds a live session
    pub async fn is_active(&self, user_id: i64) -> bool {
        self.store.is_active(user_id).await
    }

    /// Enqueue a relay job and make sure a worker is draining the queue
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or `QueueFull` from the job queue.
    pub async fn enqueue(
        &self,
        user_id: i64,
        source: String,
        destination: String,
    ) -> Result<u64, EnqueueError> {
        let job_id = self.queue.enqueue(user_id, source, destination).await?;
        self.pool.notify(user_id).await;
        Ok(job_id)
    }

    /// Cancel a queued job
    ///
    /// # Errors
    ///
    /// `InvalidState` for Running or terminal jobs, `NotFound` otherwise.
    pub async fn cancel(&self, job_id: u64) -> Result<(), CancelError> {
        self.queue.cancel(job_id).await
    }

    /// Look up any tracked job's status
    pub async fn job_status(&self, job_id: u64) -> Option<JobStatus> {
        self.queue.status(job_id).await
    }

    /// Read the operator's usage counters
    pub async fn stats(&self, user_id: i64) -> UsageCounters {
        self.ledger.read(user_id).await
    }
}
