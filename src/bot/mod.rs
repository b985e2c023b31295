//! Telegram bot layer
//!
//! A thin adapter: parses commands and dialogue input, calls the
//! coordinator's typed API, and renders replies. No business logic lives
//! here.

/// Command and dialogue handlers
pub mod handlers;
/// Dialogue state for the two-step login flow
pub mod state;
