#![deny(missing_docs)]
//! Blacksky gateway library.
//!
//! Age-gated, rate-limited media fetching for chat bots, with a Telegram
//! command surface.

/// Telegram command surface.
pub mod bot;
/// Configuration management.
pub mod config;
/// Redacted log output.
pub mod logging;
/// Access policy, cooldowns and resilient fetching.
pub mod gateway;
/// Snapshot persistence and group settings.
pub mod storage;
/// Utility functions.
pub mod utils;
