//! Sliding-window rate limits for write actions.
//!
//! Each action class keeps an in-memory list of acceptance timestamps behind
//! its own mutex. `check` prunes expired stamps and compares against the cap
//! without consuming quota; `record` is called separately, only after the
//! upstream accepted the action. State is process-wide and cleared on
//! restart.
//!
//! Every operation has an `*_at` variant taking an explicit `now`, which is
//! the clock-injection seam the tests drive; the plain variants read
//! `Instant::now()`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Action classes with independent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKey {
    PostHourly,
    PostDaily,
    VoteHourly,
}

impl RateKey {
    /// Window name as it appears in deny reasons and audit records.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RateKey::PostHourly => "post_hourly",
            RateKey::PostDaily => "post_daily",
            RateKey::VoteHourly => "vote_hourly",
        }
    }
}

#[derive(Debug)]
struct Window {
    name: &'static str,
    cap: usize,
    horizon: Duration,
    horizon_hours: u64,
    stamps: Mutex<Vec<Instant>>,
}

impl Window {
    fn new(name: &'static str, cap: usize, horizon: Duration, horizon_hours: u64) -> Self {
        Self {
            name,
            cap,
            horizon,
            horizon_hours,
            stamps: Mutex::new(Vec::new()),
        }
    }

    fn check(&self, now: Instant) -> Result<(), String> {
        let mut stamps = self.stamps.lock().unwrap_or_else(|e| e.into_inner());
        stamps.retain(|t| now.duration_since(*t) < self.horizon);
        if stamps.len() < self.cap {
            Ok(())
        } else {
            Err(format!(
                "Rate limit exceeded: {} ({} per {}h)",
                self.name, self.cap, self.horizon_hours
            ))
        }
    }

    fn record(&self, now: Instant) {
        let mut stamps = self.stamps.lock().unwrap_or_else(|e| e.into_inner());
        stamps.push(now);
    }

    fn len(&self, now: Instant) -> usize {
        let mut stamps = self.stamps.lock().unwrap_or_else(|e| e.into_inner());
        stamps.retain(|t| now.duration_since(*t) < self.horizon);
        stamps.len()
    }
}

/// In-memory sliding-window limiter for all action classes.
#[derive(Debug)]
pub struct RateLimiter {
    post_hourly: Window,
    post_daily: Window,
    vote_hourly: Window,
}

impl RateLimiter {
    /// Limiter with the production caps: 3 posts/hour, 10 posts/day,
    /// 20 votes/hour.
    #[must_use]
    pub fn new() -> Self {
        Self {
            post_hourly: Window::new("post_hourly", 3, Duration::from_secs(3600), 1),
            post_daily: Window::new("post_daily", 10, Duration::from_secs(24 * 3600), 24),
            vote_hourly: Window::new("vote_hourly", 20, Duration::from_secs(3600), 1),
        }
    }

    /// Check whether one more action would fit the window. Does not consume
    /// quota.
    pub fn check(&self, key: RateKey) -> Result<(), String> {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, key: RateKey, now: Instant) -> Result<(), String> {
        self.window(key).check(now)
    }

    /// Record an accepted action in the window.
    pub fn record(&self, key: RateKey) {
        self.record_at(key, Instant::now());
    }

    /// [`record`](Self::record) against an explicit clock reading.
    pub fn record_at(&self, key: RateKey, now: Instant) {
        self.window(key).record(now);
    }

    /// Current window occupancy after pruning.
    #[must_use]
    pub fn occupancy(&self, key: RateKey) -> usize {
        self.occupancy_at(key, Instant::now())
    }

    /// [`occupancy`](Self::occupancy) against an explicit clock reading.
    #[must_use]
    pub fn occupancy_at(&self, key: RateKey, now: Instant) -> usize {
        self.window(key).len(now)
    }

    fn window(&self, key: RateKey) -> &Window {
        match key {
            RateKey::PostHourly => &self.post_hourly,
            RateKey::PostDaily => &self.post_daily,
            RateKey::VoteHourly => &self.vote_hourly,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_cap() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check(RateKey::PostHourly).unwrap();
            limiter.record(RateKey::PostHourly);
        }
        assert_eq!(limiter.occupancy(RateKey::PostHourly), 3);
    }

    #[test]
    fn test_denies_at_cap_with_reason() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.record(RateKey::PostHourly);
        }
        let err = limiter.check(RateKey::PostHourly).unwrap_err();
        assert_eq!(err, "Rate limit exceeded: post_hourly (3 per 1h)");
    }

    #[test]
    fn test_daily_reason_format() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.record(RateKey::PostDaily);
        }
        let err = limiter.check(RateKey::PostDaily).unwrap_err();
        assert_eq!(err, "Rate limit exceeded: post_daily (10 per 24h)");
    }

    #[test]
    fn test_vote_window_independent_of_post_windows() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.record(RateKey::PostHourly);
        }
        assert!(limiter.check(RateKey::VoteHourly).is_ok());
        assert!(limiter.check(RateKey::PostHourly).is_err());
    }

    #[test]
    fn test_check_does_not_consume_quota() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            limiter.check(RateKey::VoteHourly).unwrap();
        }
        assert_eq!(limiter.occupancy(RateKey::VoteHourly), 0);
    }

    #[test]
    fn test_expired_stamps_are_pruned() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.record_at(RateKey::PostHourly, start);
        }
        assert!(limiter.check_at(RateKey::PostHourly, start).is_err());

        // One second short of the horizon the window is still full.
        let almost = start + Duration::from_secs(3599);
        assert!(limiter.check_at(RateKey::PostHourly, almost).is_err());

        let past_horizon = start + Duration::from_secs(3600);
        assert!(limiter.check_at(RateKey::PostHourly, past_horizon).is_ok());
        assert_eq!(limiter.occupancy_at(RateKey::PostHourly, past_horizon), 0);
    }

    #[test]
    fn test_sliding_window_frees_oldest_first() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.record_at(RateKey::PostHourly, start);
        limiter.record_at(RateKey::PostHourly, start + Duration::from_secs(1800));
        limiter.record_at(RateKey::PostHourly, start + Duration::from_secs(3000));

        // At start+1h only the first stamp has aged out.
        let later = start + Duration::from_secs(3600);
        assert!(limiter.check_at(RateKey::PostHourly, later).is_ok());
        assert_eq!(limiter.occupancy_at(RateKey::PostHourly, later), 2);
    }

    #[test]
    fn test_daily_window_outlives_hourly() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.record_at(RateKey::PostHourly, start);
        limiter.record_at(RateKey::PostDaily, start);

        let two_hours = start + Duration::from_secs(2 * 3600);
        assert_eq!(limiter.occupancy_at(RateKey::PostHourly, two_hours), 0);
        assert_eq!(limiter.occupancy_at(RateKey::PostDaily, two_hours), 1);
    }

    #[test]
    fn test_occupancy_never_exceeds_cap_when_admitted() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            if limiter.check(RateKey::VoteHourly).is_ok() {
                limiter.record(RateKey::VoteHourly);
            }
            assert!(limiter.occupancy(RateKey::VoteHourly) <= 20);
        }
        assert!(limiter.check(RateKey::VoteHourly).is_err());
    }
}
