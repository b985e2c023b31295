//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the tuning
//! constants for the session-and-job coordinator.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Comma-separated list of operator IDs allowed to use the bot
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns the set of operator IDs that are allowed to use the bot
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        self.allowed_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// Job queue configuration
/// Maximum queued (not yet running) jobs per operator
pub const MAX_QUEUE_DEPTH: usize = 16;
/// How long terminal jobs remain queryable after completion
pub const TERMINAL_JOB_TTL_SECS: u64 = 3600;
/// Maximum number of retained terminal jobs across all operators
pub const TERMINAL_JOB_CAPACITY: u64 = 10_000;

// Relay worker configuration
/// Maximum concurrent transfers across all operators
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;
/// Attempts per transfer, including the first (transient failures only)
pub const MAX_TRANSFER_ATTEMPTS: usize = 3;
/// Initial backoff between transfer attempts
pub const TRANSFER_INITIAL_BACKOFF_MS: u64 = 500;
/// Backoff ceiling between transfer attempts
pub const TRANSFER_MAX_BACKOFF_MS: u64 = 10_000;
/// Wall-clock limit for a single transfer attempt
pub const TRANSFER_TIMEOUT_SECS: u64 = 600;
/// A Running job whose worker has not reported progress for this long
/// is considered orphaned and failed by the supervisor. Workers report
/// progress at attempt start and after every chunk, so this must stay
/// above the per-attempt timeout plus the backoff ceiling or a worker
/// legally waiting on a slow first byte gets falsely orphaned.
pub const WORKER_LIVENESS_SECS: u64 = 660;
/// How often the supervisor scans for orphaned jobs
pub const SUPERVISOR_INTERVAL_SECS: u64 = 30;

/// Tuning knobs for the relay worker pool
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Attempts per transfer, including the first
    pub max_attempts: usize,
    /// Initial retry backoff
    pub initial_backoff: Duration,
    /// Retry backoff ceiling
    pub max_backoff: Duration,
    /// Wall-clock limit for one attempt
    pub attempt_timeout: Duration,
    /// Cross-user transfer parallelism bound
    pub max_concurrent: usize,
    /// Liveness deadline for orphan detection; keep above
    /// `attempt_timeout` plus `max_backoff`
    pub liveness_deadline: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_TRANSFER_ATTEMPTS,
            initial_backoff: Duration::from_millis(TRANSFER_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(TRANSFER_MAX_BACKOFF_MS),
            attempt_timeout: Duration::from_secs(TRANSFER_TIMEOUT_SECS),
            max_concurrent: MAX_CONCURRENT_TRANSFERS,
            liveness_deadline: Duration::from_secs(WORKER_LIVENESS_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_users_parsing() {
        let mut settings = Settings {
            telegram_token: "dummy".to_string(),
            allowed_users_str: None,
        };

        // Comma
        settings.allowed_users_str = Some("123,456".to_string());
        let allowed = settings.allowed_users();
        assert!(allowed.contains(&123));
        assert!(allowed.contains(&456));
        assert_eq!(allowed.len(), 2);

        // Space
        settings.allowed_users_str = Some("111 222".to_string());
        let allowed = settings.allowed_users();
        assert!(allowed.contains(&111));
        assert!(allowed.contains(&222));
        assert_eq!(allowed.len(), 2);

        // Semicolon and mixed
        settings.allowed_users_str = Some("333; 444, 555".to_string());
        let allowed = settings.allowed_users();
        assert_eq!(allowed.len(), 3);

        // Bad tokens are skipped
        settings.allowed_users_str = Some("abc, 777".to_string());
        let allowed = settings.allowed_users();
        assert!(allowed.contains(&777));
        assert_eq!(allowed.len(), 1);
    }

    #[test]
    fn test_relay_config_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.max_attempts, MAX_TRANSFER_ATTEMPTS);
        assert!(cfg.initial_backoff < cfg.max_backoff);
        // An attempt that runs to its timeout must never look orphaned.
        assert!(cfg.liveness_deadline > cfg.attempt_timeout + cfg.max_backoff);
    }
}
