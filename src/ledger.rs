//! Usage accounting
//!
//! Per-user monotonic counters, written by relay workers on the success
//! path only. Increments for the same user are serialized by the write
//! lock, so concurrent workers can never lose an update.

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-user relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounters {
    /// Messages relayed successfully
    pub messages_relayed: u64,
    /// Media bytes relayed successfully
    pub media_bytes_relayed: u64,
}

/// Keyed store of usage counters
#[derive(Default)]
pub struct UsageLedger {
    counters: RwLock<HashMap<i64, UsageCounters>>,
}

impl UsageLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a completed relay to this user
    pub async fn increment(&self, user_id: i64, messages: u64, bytes: u64) {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(user_id).or_default();
        entry.messages_relayed += messages;
        entry.media_bytes_relayed += bytes;
    }

    /// Read this user's counters; unknown users read as zero
    pub async fn read(&self, user_id: i64) -> UsageCounters {
        let counters = self.counters.read().await;
        counters.get(&user_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unknown_user_reads_zero() {
        let ledger = UsageLedger::new();
        assert_eq!(ledger.read(42).await, UsageCounters::default());
    }

    #[tokio::test]
    async fn test_increment_accumulates() {
        let ledger = UsageLedger::new();
        ledger.increment(1, 1, 100).await;
        ledger.increment(1, 1, 250).await;

        let counters = ledger.read(1).await;
        assert_eq!(counters.messages_relayed, 2);
        assert_eq!(counters.media_bytes_relayed, 350);
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_nothing() {
        let ledger = Arc::new(UsageLedger::new());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    ledger.increment(7, 1, 10).await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let counters = ledger.read(7).await;
        assert_eq!(counters.messages_relayed, 800);
        assert_eq!(counters.media_bytes_relayed, 8000);

        // Other users are untouched.
        assert_eq!(ledger.read(8).await, UsageCounters::default());
    }
}
