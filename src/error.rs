//! Error taxonomy for the session-and-job coordinator
//!
//! Every error that crosses the coordinator boundary is typed; nothing in
//! this module is fatal to the process. One operator's failure must never
//! affect another operator's sessions or queues.

use thiserror::Error;

/// Errors produced by session lifecycle operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// Credentials were rejected or malformed
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The provided second-factor code did not match
    #[error("second factor rejected: {0}")]
    SecondFactor(String),
    /// `complete_login` was called without a pending second-factor prompt
    #[error("no login awaiting a second factor for this user")]
    NoPendingLogin,
    /// The transport could not establish a connection
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors produced when enqueueing a relay job
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The operator has no Active session
    #[error("not authenticated: log in before enqueueing relay jobs")]
    NotAuthenticated,
    /// The operator's queue is at its configured bound
    #[error("queue full: at most {0} jobs may be queued")]
    QueueFull(usize),
}

/// Errors produced when cancelling a queued job
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CancelError {
    /// No job with this ID is currently queued or tracked
    #[error("job {0} not found")]
    NotFound(u64),
    /// The job is Running or already terminal; only Queued jobs cancel
    #[error("job {0} is not queued; only queued jobs can be cancelled")]
    InvalidState(u64),
}

/// Errors produced during a media transfer
///
/// Classification drives the retry policy: transient errors are retried
/// with backoff up to the configured bound, permanent errors surface
/// immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Likely to succeed on retry (timeout, rate limit, connection reset)
    #[error("transient transfer error: {0}")]
    Transient(String),
    /// Will not succeed on retry (bad link, permission denied)
    #[error("permanent transfer error: {0}")]
    Permanent(String),
    /// The session was revoked after the job was enqueued
    #[error("session revoked")]
    SessionUnavailable,
    /// The transfer was cooperatively aborted at a chunk boundary
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the retry loop may attempt this transfer again
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(TransferError::Transient("timeout".into()).is_transient());
        assert!(!TransferError::Permanent("404".into()).is_transient());
        assert!(!TransferError::SessionUnavailable.is_transient());
        assert!(!TransferError::Cancelled.is_transient());
    }
}
