//! Sliding-window admission control.
//!
//! One algorithm, two front ends:
//!
//! - [`RequestLimiter`]: a single shared window guarding every outbound
//!   request to Habr, whoever issues it (the scheduler or an on-demand
//!   command).
//! - [`KeyedLimiter`]: one window per caller, guarding the on-demand
//!   `news` command so one caller cannot monopolise the fetcher.
//!
//! Both are built once at startup inside [`Limiters`] and handed around by
//! `Arc`. The prune-check-append sequence always runs under a mutex, so the
//! capacity bound holds across tokio worker threads.

use crate::config::{ConfigError, RateLimitConfig};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, instrument};

/// The admission timestamps of one window.
///
/// Invariant: after [`SlidingWindow::prune`], `stamps.len() <= capacity`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            stamps: VecDeque::with_capacity(capacity),
        }
    }

    /// Drop every admission at least `window` older than `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then record `now` if there is room.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.stamps.len() < self.capacity {
            self.stamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// How long until a call at `now` would be admitted. Zero if it would be
    /// admitted right away. Does not record anything.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.stamps.len() < self.capacity {
            return Duration::ZERO;
        }
        match self.stamps.front() {
            Some(&oldest) => self
                .window
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single window shared by all callers.
#[derive(Debug)]
pub struct RequestLimiter {
    window: Mutex<SlidingWindow>,
}

impl RequestLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new(capacity, window)),
        }
    }

    /// Admit now if there is room.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> bool {
        lock(&self.window).try_admit(now)
    }

    /// Suspend until an admission is recorded for this caller.
    ///
    /// After each sleep the window is checked again under the lock, so a
    /// concurrent caller that got in first pushes this one to the next slot.
    ///
    /// # Returns
    ///
    /// The total time spent waiting, `Duration::ZERO` if admitted at once.
    #[instrument(level = "debug", skip_all)]
    pub async fn block_until_admitted(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut window = lock(&self.window);
                let now = Instant::now();
                if window.try_admit(now) {
                    return now.saturating_duration_since(started);
                }
                window.wait_time(now)
            };
            debug!(wait_ms = wait.as_millis() as u64, "Outbound rate limit reached; waiting");
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// One window per key.
#[derive(Debug)]
pub struct KeyedLimiter<K> {
    capacity: usize,
    window: Duration,
    windows: Mutex<HashMap<K, SlidingWindow>>,
}

impl<K> KeyedLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `key` now if its window has room.
    pub fn admit(&self, key: &K) -> bool {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &K, now: Instant) -> bool {
        let mut windows = lock(&self.windows);
        let (capacity, window) = (self.capacity, self.window);
        windows
            .entry(key.clone())
            .or_insert_with(|| SlidingWindow::new(capacity, window))
            .try_admit(now)
    }

    /// Time until `key` would be admitted; zero when it would be admitted now.
    pub fn wait_time(&self, key: &K) -> Duration {
        self.wait_time_at(key, Instant::now())
    }

    pub fn wait_time_at(&self, key: &K, now: Instant) -> Duration {
        lock(&self.windows)
            .get_mut(key)
            .map_or(Duration::ZERO, |w| w.wait_time(now))
    }

    /// Forget keys with no admissions left in their window.
    ///
    /// A forgotten key behaves exactly like a fresh one on its next call.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut windows = lock(&self.windows);
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now);
            !w.is_empty()
        });
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        lock(&self.windows).len()
    }
}

/// The process-wide limiter set.
#[derive(Debug, Clone)]
pub struct Limiters {
    /// Guards every outbound page fetch.
    pub outbound: Arc<RequestLimiter>,
    /// Guards the on-demand command, per caller.
    pub commands: Arc<KeyedLimiter<String>>,
}

impl Limiters {
    pub fn from_config(cfg: &RateLimitConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            outbound: Arc::new(RequestLimiter::new(
                cfg.max_outbound_requests,
                cfg.outbound_window()?,
            )),
            commands: Arc::new(KeyedLimiter::new(
                cfg.max_commands_per_caller,
                cfg.command_window()?,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_millis((s * 1000.0) as u64)
    }

    #[test]
    fn test_unkeyed_one_per_second() {
        let limiter = RequestLimiter::new(1, secs(1.0));
        let t0 = Instant::now();
        assert!(limiter.admit_at(t0));
        assert!(!limiter.admit_at(t0 + secs(0.3)));
        assert!(limiter.admit_at(t0 + secs(1.1)));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut window = SlidingWindow::new(3, secs(1.0));
        let t0 = Instant::now();
        let admitted = (0..10)
            .filter(|i| window.try_admit(t0 + secs(0.05 * f64::from(*i))))
            .count();
        assert_eq!(admitted, 3);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_wait_time_counts_down_from_oldest() {
        let mut window = SlidingWindow::new(1, secs(1.0));
        let t0 = Instant::now();
        assert_eq!(window.wait_time(t0), Duration::ZERO);
        assert!(window.try_admit(t0));
        assert_eq!(window.wait_time(t0 + secs(0.25)), secs(0.75));
        assert_eq!(window.wait_time(t0 + secs(1.0)), Duration::ZERO);
    }

    #[test]
    fn test_keyed_isolates_callers() {
        let limiter: KeyedLimiter<String> = KeyedLimiter::new(1, secs(60.0));
        let t0 = Instant::now();
        let (a, b) = ("A".to_string(), "B".to_string());
        assert!(limiter.admit_at(&a, t0));
        assert!(!limiter.admit_at(&a, t0 + secs(5.0)));
        assert!(limiter.admit_at(&b, t0 + secs(5.0)));
    }

    #[test]
    fn test_keyed_wait_time_does_not_record() {
        let limiter: KeyedLimiter<u64> = KeyedLimiter::new(1, secs(60.0));
        let t0 = Instant::now();
        assert_eq!(limiter.wait_time_at(&7, t0), Duration::ZERO);
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.admit_at(&7, t0));
        assert_eq!(limiter.wait_time_at(&7, t0 + secs(20.0)), secs(40.0));
        assert_eq!(limiter.wait_time_at(&7, t0 + secs(20.0)), secs(40.0));
    }

    #[test]
    fn test_sweep_drops_only_idle_keys() {
        let limiter: KeyedLimiter<&'static str> = KeyedLimiter::new(1, secs(10.0));
        let t0 = Instant::now();
        assert!(limiter.admit_at(&"old", t0));
        assert!(limiter.admit_at(&"fresh", t0 + secs(8.0)));
        assert_eq!(limiter.sweep_idle_at(t0 + secs(12.0)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.admit_at(&"old", t0 + secs(12.0)));
    }

    #[tokio::test]
    async fn test_block_until_admitted_waits_out_the_window() {
        let limiter = RequestLimiter::new(1, Duration::from_millis(100));
        let started = Instant::now();
        limiter.block_until_admitted().await;
        limiter.block_until_admitted().await;
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn test_concurrent_callers_respect_capacity() {
        let limiter = Arc::new(RequestLimiter::new(2, Duration::from_millis(100)));
        let started = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.block_until_admitted().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn test_limiters_from_config() {
        let limiters = Limiters::from_config(&RateLimitConfig::default()).unwrap();
        assert!(limiters.outbound.admit());
        assert!(!limiters.outbound.admit());
        assert!(limiters.commands.admit(&"42".to_string()));
        assert!(!limiters.commands.admit(&"42".to_string()));
    }

    #[test]
    fn test_limiters_reject_unrepresentable_window() {
        let cfg = RateLimitConfig {
            outbound_window_seconds: 1e20,
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            Limiters::from_config(&cfg),
            Err(ConfigError::BadWindow("outbound_window_seconds"))
        ));
    }
}
