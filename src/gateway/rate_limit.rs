//! Per-identity cooldown windows
//!
//! An identity that was served content may not be served again until its
//! cooldown window expires. The check and the insert happen under one lock,
//! so of N concurrent callers for the same identity exactly one wins.

use crate::gateway::clock::Clock;
use crate::gateway::identity::Identity;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// In-memory cooldown tracker
///
/// Entries are overwritten on each successful acquire and otherwise only
/// removed by [`RateLimiter::sweep_expired`].
pub struct RateLimiter {
    /// identity -> expiry of its current window
    entries: Mutex<HashMap<Identity, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    /// Counter for rejected acquisitions (for logging throttling and stats)
    denied_count: AtomicU64,
}

impl RateLimiter {
    /// Creates an empty limiter reading time from `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            denied_count: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Identity, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new cooldown window unless one is still running
    ///
    /// Returns `true` if the window was acquired, `false` if the identity
    /// is still cooling down.
    ///
    /// # Examples
    ///
    /// ```
    /// use blacksky_gateway::gateway::clock::SystemClock;
    /// use blacksky_gateway::gateway::identity::IdentityNormalizer;
    /// use blacksky_gateway::gateway::rate_limit::RateLimiter;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let limiter = RateLimiter::new(Arc::new(SystemClock));
    /// let id = IdentityNormalizer::new("telegram").normalize(42_i64).unwrap();
    ///
    /// assert!(limiter.try_acquire(&id, Duration::from_secs(30)));
    /// assert!(!limiter.try_acquire(&id, Duration::from_secs(30)));
    /// ```
    pub fn try_acquire(&self, identity: &Identity, window: Duration) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries();

        if entries.get(identity).is_some_and(|expiry| *expiry > now) {
            drop(entries);
            let count = self.denied_count.fetch_add(1, Ordering::Relaxed) + 1;
            // Log only every 100th denial to prevent log flooding
            if count.is_multiple_of(100) {
                debug!("⏳ Denied {count} acquisitions during cooldown (recent: {identity})");
            }
            return false;
        }

        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let expiry = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        entries.insert(identity.clone(), expiry);
        true
    }

    /// Whole seconds until the identity's window ends, 0 when none is running
    ///
    /// Partial seconds round up, so a running window never reports 0.
    #[must_use]
    pub fn remaining_seconds(&self, identity: &Identity) -> u64 {
        let now = self.clock.now();
        let Some(expiry) = self.entries().get(identity).copied() else {
            return 0;
        };
        let remaining_ms = (expiry - now).num_milliseconds();
        if remaining_ms <= 0 {
            return 0;
        }
        u64::try_from(remaining_ms).map_or(0, |ms| ms.div_ceil(1000))
    }

    /// Removes entries whose window has ended, returning how many went away
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    /// Returns the current number of entries, expired ones included
    ///
    /// Useful for monitoring and health checks.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    /// Returns the number of windows still running
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.entries().values().filter(|expiry| **expiry > now).count()
    }

    /// Returns the total number of rejected acquisitions
    #[must_use]
    pub fn denied_count(&self) -> u64 {
        self.denied_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::clock::ManualClock;
    use crate::gateway::identity::IdentityNormalizer;

    const WINDOW: Duration = Duration::from_secs(30);

    fn identity(raw: &str) -> Identity {
        IdentityNormalizer::new("telegram")
            .normalize(raw)
            .unwrap_or_else(|| panic!("invalid test identity {raw}"))
    }

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_first_attempt_acquires() {
        let (_, limiter) = limiter();
        let id = identity("12345");

        assert_eq!(limiter.remaining_seconds(&id), 0);
        assert!(limiter.try_acquire(&id, WINDOW));
        assert_eq!(limiter.remaining_seconds(&id), 30);
    }

    #[test]
    fn test_cooldown_blocks_second_attempt() {
        let (_, limiter) = limiter();
        let id = identity("12345");

        assert!(limiter.try_acquire(&id, WINDOW));
        assert!(!limiter.try_acquire(&id, WINDOW));
        assert_eq!(limiter.denied_count(), 1);
    }

    #[test]
    fn test_different_users_independent() {
        let (_, limiter) = limiter();

        assert!(limiter.try_acquire(&identity("111"), WINDOW));
        assert!(limiter.try_acquire(&identity("222"), WINDOW));
    }

    #[test]
    fn test_remaining_seconds_counts_down_to_zero() {
        let (clock, limiter) = limiter();
        let id = identity("12345");
        assert!(limiter.try_acquire(&id, WINDOW));

        let mut previous = limiter.remaining_seconds(&id);
        for _ in 0..35 {
            clock.advance(Duration::from_millis(1_000));
            let current = limiter.remaining_seconds(&id);
            assert!(current <= previous);
            previous = current;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_partial_second_rounds_up() {
        let (clock, limiter) = limiter();
        let id = identity("12345");
        assert!(limiter.try_acquire(&id, WINDOW));

        clock.advance(Duration::from_millis(29_500));
        assert_eq!(limiter.remaining_seconds(&id), 1);
        assert!(!limiter.try_acquire(&id, WINDOW));
    }

    #[test]
    fn test_window_expiry_allows_reacquire() {
        let (clock, limiter) = limiter();
        let id = identity("12345");
        assert!(limiter.try_acquire(&id, WINDOW));

        clock.advance(Duration::from_secs(31));
        assert!(limiter.try_acquire(&id, WINDOW));
        assert_eq!(limiter.remaining_seconds(&id), 30);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (clock, limiter) = limiter();
        assert!(limiter.try_acquire(&identity("111"), Duration::from_secs(10)));
        assert!(limiter.try_acquire(&identity("222"), Duration::from_secs(60)));

        clock.advance(Duration::from_secs(20));
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.entry_count(), 1);
        assert_eq!(limiter.active_count(), 1);
        assert!(limiter.remaining_seconds(&identity("222")) > 0);
    }

    #[test]
    fn test_active_count_skips_unswept_expired() {
        let (clock, limiter) = limiter();
        assert!(limiter.try_acquire(&identity("111"), Duration::from_secs(10)));
        assert!(limiter.try_acquire(&identity("222"), Duration::from_secs(60)));
        assert_eq!(limiter.active_count(), 2);

        clock.advance(Duration::from_secs(20));
        assert_eq!(limiter.entry_count(), 2);
        assert_eq!(limiter.active_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_winner_under_concurrency() {
        let (_, limiter) = limiter();
        let limiter = Arc::new(limiter);
        let id = identity("racer");

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                let id = id.clone();
                tokio::spawn(async move { limiter.try_acquire(&id, WINDOW) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap_or(false) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(limiter.denied_count(), 63);
    }
}
