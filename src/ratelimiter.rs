//! Local fixed-window rate limiting.
//!
//! Every identifier owns its own window, opened by its first request after
//! a reset. Expired windows are replaced lazily on the next request and
//! reclaimed by an occasional full sweep.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Chance of sweeping expired entries on each [`RateLimiter::check`].
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.01;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Get the current Unix timestamp in milliseconds.
    fn now_millis(&self) -> u64;
}

/// System clock using the OS time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Limits applied to one class of endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window duration in milliseconds.
    pub window_ms: u64,
    /// Maximum accepted requests per identifier per window.
    pub max_requests: u32,
}

impl RateLimitConfig {
    /// Create a new [`RateLimitConfig`].
    pub const fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }
}

/// Outcome of a [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Unix timestamp in milliseconds at which the window ends.
    pub reset_time: u64,
    /// Requests still accepted in the current window.
    pub remaining: u32,
}

impl Decision {
    /// Seconds left before the window ends, rounded up.
    pub fn retry_after(&self, now: u64) -> u64 {
        self.reset_time.saturating_sub(now).div_ceil(1000)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_time: u64,
}

struct Inner {
    clock: Arc<dyn Clock>,
    sweep_probability: f64,
    windows: DashMap<String, Window>,
}

/// In-memory limiter shared by every request handler.
///
/// Cloning is cheap, clones share the same windows.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("sweep_probability", &self.inner.sweep_probability)
            .field("entries", &self.inner.windows.len())
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_SWEEP_PROBABILITY)
    }
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// `sweep_probability` is clamped between `0.0` (never sweep) and `1.0`
    /// (sweep on every check).
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use waitlist::ratelimiter::{RateLimitConfig, RateLimiter, SystemClock};
    ///
    /// let limiter = RateLimiter::new(Arc::new(SystemClock), 0.01);
    /// let config = RateLimitConfig::new(60_000, 2); // 2 requests per minute.
    ///
    /// assert!(limiter.check("1.2.3.4", &config).allowed);
    /// assert!(limiter.check("1.2.3.4", &config).allowed);
    /// assert!(!limiter.check("1.2.3.4", &config).allowed);
    /// ```
    pub fn new(clock: Arc<dyn Clock>, sweep_probability: f64) -> Self {
        let sweep_probability = if sweep_probability.is_nan() {
            DEFAULT_SWEEP_PROBABILITY
        } else {
            sweep_probability.clamp(0.0, 1.0)
        };

        Self {
            inner: Arc::new(Inner {
                clock,
                sweep_probability,
                windows: DashMap::new(),
            }),
        }
    }

    /// Current time according to the limiter clock.
    pub fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    /// Check whether a new request from `identifier` is accepted and count
    /// it if so. Rejected requests leave the window untouched.
    pub fn check(&self, identifier: &str, config: &RateLimitConfig) -> Decision {
        let now = self.now();

        if self.inner.sweep_probability > 0.0
            && rand::thread_rng().gen_bool(self.inner.sweep_probability)
        {
            self.sweep_at(now);
        }

        // Live windows are counted in place, without allocating a key.
        if let Some(mut window) = self.inner.windows.get_mut(identifier) {
            if now <= window.reset_time {
                return Self::count(&mut window, config);
            }
        }

        // The entry guard holds the shard lock until the decision is made.
        match self.inner.windows.entry(identifier.to_owned()) {
            Entry::Occupied(mut entry) if now <= entry.get().reset_time => {
                Self::count(entry.get_mut(), config)
            },
            entry => {
                let window = Window {
                    count: 1,
                    reset_time: now.saturating_add(config.window_ms),
                };
                entry.insert(window);

                Decision {
                    allowed: true,
                    reset_time: window.reset_time,
                    remaining: config.max_requests.saturating_sub(1),
                }
            },
        }
    }

    fn count(window: &mut Window, config: &RateLimitConfig) -> Decision {
        if window.count >= config.max_requests {
            Decision {
                allowed: false,
                reset_time: window.reset_time,
                remaining: 0,
            }
        } else {
            window.count += 1;
            Decision {
                allowed: true,
                reset_time: window.reset_time,
                remaining: config.max_requests - window.count,
            }
        }
    }

    /// Remove every expired window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.now())
    }

    fn sweep_at(&self, now: u64) -> usize {
        let before = self.inner.windows.len();
        self.inner.windows.retain(|_, window| now <= window.reset_time);
        let removed = before.saturating_sub(self.inner.windows.len());

        tracing::debug!(removed, remaining = before - removed, "rate limiter swept");
        metrics::gauge!("rate_limit_entries").set(self.inner.windows.len() as f64);

        removed
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.inner.windows.len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.windows.is_empty()
    }
}

/// Clock driven by hand, for tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<std::sync::atomic::AtomicU64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: Arc::new(std::sync::atomic::AtomicU64::new(now)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "1.2.3.4";
    const OTHER_IP: &str = "5.6.7.8";
    const START: u64 = 1_700_000_000_000;
    const FIVE_MINUTES: RateLimitConfig = RateLimitConfig::new(300_000, 10);

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(START);
        (RateLimiter::new(Arc::new(clock.clone()), 0.0), clock)
    }

    #[test]
    fn test_window_fills_then_rejects() {
        let (limiter, clock) = limiter();

        let first = limiter.check(IP, &FIVE_MINUTES);
        assert!(first.allowed);
        assert_eq!(first.remaining, 9);
        assert_eq!(first.reset_time, START + 300_000);

        for expected in (0..9).rev() {
            clock.advance(1_000);
            let decision = limiter.check(IP, &FIVE_MINUTES);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.reset_time, first.reset_time);
        }

        clock.advance(1_000);
        let rejected = limiter.check(IP, &FIVE_MINUTES);
        assert_eq!(
            rejected,
            Decision {
                allowed: false,
                reset_time: first.reset_time,
                remaining: 0,
            }
        );
    }

    #[test]
    fn test_new_window_after_reset() {
        let (limiter, clock) = limiter();

        let first = limiter.check(IP, &FIVE_MINUTES);
        for _ in 0..15 {
            limiter.check(IP, &FIVE_MINUTES);
        }
        assert!(!limiter.check(IP, &FIVE_MINUTES).allowed);

        clock.set(first.reset_time + 1);
        let decision = limiter.check(IP, &FIVE_MINUTES);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_time, first.reset_time + 1 + 300_000);
    }

    #[test]
    fn test_expired_window_is_replaced_in_place() {
        let (limiter, clock) = limiter();

        let first = limiter.check(IP, &FIVE_MINUTES);
        for _ in 0..20 {
            limiter.check(IP, &FIVE_MINUTES);
        }
        assert_eq!(limiter.len(), 1);

        // Expired but not swept: the stale window must not be counted.
        clock.set(first.reset_time + 1);
        let decision = limiter.check(IP, &FIVE_MINUTES);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(limiter.len(), 1);

        let next = limiter.check(IP, &FIVE_MINUTES);
        assert_eq!(next.remaining, 8);
        assert_eq!(next.reset_time, decision.reset_time);
    }

    #[test]
    fn test_reset_time_is_inclusive() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(1_000, 1);

        let first = limiter.check(IP, &config);
        clock.set(first.reset_time);

        // Still the same window.
        let decision = limiter.check(IP, &config);
        assert!(!decision.allowed);
        assert_eq!(decision.reset_time, first.reset_time);

        clock.advance(1);
        assert!(limiter.check(IP, &config).allowed);
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(60_000, 2);

        limiter.check(IP, &config);
        limiter.check(IP, &config);

        let rejected = limiter.check(IP, &config);
        for _ in 0..50 {
            clock.advance(100);
            assert_eq!(limiter.check(IP, &config), rejected);
        }

        // Rejections never extended the window.
        clock.set(rejected.reset_time + 1);
        assert_eq!(limiter.check(IP, &config).remaining, 1);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let config = RateLimitConfig::new(60_000, 3);

        let (isolated, _) = limiter();
        let alone: Vec<bool> =
            (0..5).map(|_| isolated.check(IP, &config).allowed).collect();

        let (shared, _) = limiter();
        let mut first = Vec::new();
        let mut second = Vec::new();
        for _ in 0..5 {
            first.push(shared.check(IP, &config).allowed);
            second.push(shared.check(OTHER_IP, &config).allowed);
        }

        assert_eq!(alone, vec![true, true, true, false, false]);
        assert_eq!(alone, first);
        assert_eq!(alone, second);
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn test_remaining_never_negative() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(60_000, 1);

        let first = limiter.check("", &config);
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);
        assert_eq!(limiter.check("", &config).remaining, 0);
    }

    #[test]
    fn test_boundary_burst_is_preserved() {
        let (limiter, clock) = limiter();
        let config = RateLimitConfig::new(10_000, 3);

        // First request opens the window, the rest arrive right before it ends.
        let first = limiter.check(IP, &config);
        clock.set(first.reset_time);
        assert!(limiter.check(IP, &config).allowed);
        assert!(limiter.check(IP, &config).allowed);

        // A new window opens right after.
        clock.advance(1);
        let accepted = (0..4).filter(|_| limiter.check(IP, &config).allowed).count();
        assert_eq!(accepted, 3);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (limiter, clock) = limiter();
        let short = RateLimitConfig::new(1_000, 1);
        let long = RateLimitConfig::new(60_000, 1);

        limiter.check(IP, &short);
        limiter.check(OTHER_IP, &long);
        assert!(!limiter.check(OTHER_IP, &long).allowed);

        clock.advance(5_000);
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);

        // Swept identifier behaves like a new one.
        let decision = limiter.check(IP, &short);
        assert!(decision.allowed);
        assert_eq!(decision.reset_time, START + 5_000 + 1_000);

        // Other identifier kept its window.
        assert!(!limiter.check(OTHER_IP, &long).allowed);
    }

    #[test]
    fn test_sweep_on_every_check() {
        let clock = ManualClock::new(START);
        let limiter = RateLimiter::new(Arc::new(clock.clone()), 1.0);
        let config = RateLimitConfig::new(1_000, 5);

        for ip in ["a", "b", "c"] {
            limiter.check(ip, &config);
        }
        assert_eq!(limiter.len(), 3);

        clock.advance(2_000);
        limiter.check("d", &config);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_invalid_probability_is_clamped() {
        let limiter = RateLimiter::new(Arc::new(ManualClock::new(START)), 42.0);
        assert_eq!(limiter.inner.sweep_probability, 1.0);

        let limiter = RateLimiter::new(Arc::new(ManualClock::new(START)), -1.0);
        assert_eq!(limiter.inner.sweep_probability, 0.0);

        let limiter = RateLimiter::new(Arc::new(ManualClock::new(START)), f64::NAN);
        assert_eq!(limiter.inner.sweep_probability, DEFAULT_SWEEP_PROBABILITY);
    }

    #[test]
    fn test_concurrent_checks_respect_limit() {
        let (limiter, _) = limiter();
        let config = RateLimitConfig::new(60_000, 25);

        let accepted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = limiter.clone();
                    scope.spawn(move || {
                        (0..50).filter(|_| limiter.check(IP, &config).allowed).count()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(accepted, 25);
    }

    #[test]
    fn test_retry_after() {
        let decision = Decision {
            allowed: false,
            reset_time: START + 1_500,
            remaining: 0,
        };

        assert_eq!(decision.retry_after(START), 2);
        assert_eq!(decision.retry_after(START + 1_000), 1);
        assert_eq!(decision.retry_after(START + 1_500), 0);
        assert_eq!(decision.retry_after(START + 9_000), 0);
    }
}
