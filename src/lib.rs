#![deny(missing_docs)]
//! Media Relay Bot
//!
//! A command-driven Telegram bot that manages a secondary authenticated
//! "user session" per operator and relays media (download-from-link,
//! upload-to-destination) through it, with per-user proxy configuration
//! and usage accounting.

/// Telegram bot layer (commands, dialogue states, handlers)
pub mod bot;
/// Configuration management
pub mod config;
/// Session-and-job coordinator facade
pub mod coordinator;
/// Error taxonomy
pub mod error;
/// Usage accounting
pub mod ledger;
/// Per-user relay job queue
pub mod queue;
/// Per-user session store
pub mod session;
/// User-session transport abstraction and HTTP implementation
pub mod transport;
/// Relay worker pool and supervisor
pub mod worker;
