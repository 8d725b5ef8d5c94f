//! Windowed request/token rate limiter for embedding calls.
//!
//! Three rolling windows are enforced per process: requests per minute,
//! tokens per minute, and tokens per day. Admission happens under a single
//! async mutex that is held across the wait, so concurrent callers are
//! admitted strictly in arrival order and cannot thunder when a window
//! rolls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Window quotas. A zero quota is treated as "admit one request/batch per
/// window" rather than "never admit".
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 3_000,
            tokens_per_minute: 1_000_000,
            tokens_per_day: 50_000_000,
        }
    }
}

/// Estimate the token cost of a text as `⌈len/4⌉`, floor 1.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// Summed token estimate for a batch.
pub fn estimate_batch_tokens<S: AsRef<str>>(texts: &[S]) -> u64 {
    texts.iter().map(|t| estimate_tokens(t.as_ref())).sum()
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// In-process windowed limiter. Construct once and inject; distributed
/// coordination composes a second acquire step in front of this one.
pub struct RateLimiter {
    config: LimiterConfig,
    state: Mutex<Windows>,
}

#[derive(Debug)]
struct Windows {
    minute_start: Instant,
    minute_requests: u64,
    minute_tokens: u64,
    day_start: Instant,
    day_tokens: u64,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(Windows {
                minute_start: now,
                minute_requests: 0,
                minute_tokens: 0,
                day_start: now,
                day_tokens: 0,
            }),
        }
    }

    /// Block until admitting `requests`/`tokens` fits every window, then
    /// admit by incrementing all counters.
    ///
    /// The state mutex is held across the wait: it is the admission queue,
    /// and tokio's fair mutex serves waiters in arrival order.
    pub async fn acquire(&self, requests: u64, tokens: u64) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            state.roll(now);

            if state.fits(&self.config, requests, tokens) {
                state.minute_requests += requests;
                state.minute_tokens += tokens;
                state.day_tokens += tokens;
                return;
            }

            let wait = state.next_eligible(&self.config, requests, tokens, now);
            debug!(wait_ms = wait.as_millis() as u64, "rate window full, waiting");
            sleep(wait).await;
        }
    }
}

impl Windows {
    /// Deterministic rollover relative to each window's start.
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.minute_start) >= MINUTE {
            self.minute_start = now;
            self.minute_requests = 0;
            self.minute_tokens = 0;
        }
        if now.duration_since(self.day_start) >= DAY {
            self.day_start = now;
            self.day_tokens = 0;
        }
    }

    fn fits(&self, config: &LimiterConfig, requests: u64, tokens: u64) -> bool {
        admits(self.minute_requests, requests, config.requests_per_minute)
            && admits(self.minute_tokens, tokens, config.tokens_per_minute)
            && admits(self.day_tokens, tokens, config.tokens_per_day)
    }

    /// How long until the earliest failing window rolls over.
    fn next_eligible(
        &self,
        config: &LimiterConfig,
        requests: u64,
        tokens: u64,
        now: Instant,
    ) -> Duration {
        let minute_blocked = !admits(self.minute_requests, requests, config.requests_per_minute)
            || !admits(self.minute_tokens, tokens, config.tokens_per_minute);
        let day_blocked = !admits(self.day_tokens, tokens, config.tokens_per_day);

        let until_minute = (self.minute_start + MINUTE).saturating_duration_since(now);
        let until_day = (self.day_start + DAY).saturating_duration_since(now);

        match (minute_blocked, day_blocked) {
            (true, false) => until_minute,
            (false, true) => until_day,
            _ => until_minute.min(until_day),
        }
    }
}

/// An admission fits when it stays within the quota; an admission larger
/// than the whole quota is allowed alone at the start of a fresh window, so
/// `acquire` always terminates.
fn admits(used: u64, add: u64, quota: u64) -> bool {
    used + add <= quota || (add > quota && used == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(rpm: u64, tpm: u64, tpd: u64) -> RateLimiter {
        RateLimiter::new(LimiterConfig {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
            tokens_per_day: tpd,
        })
    }

    #[test]
    fn token_estimates() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_batch_tokens(&["abcd", "abcde", ""]), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn third_request_waits_for_minute_roll() {
        let limiter = limiter(2, 1_000_000_000, 1_000_000_000);
        let start = Instant::now();

        limiter.acquire(1, 1).await;
        limiter.acquire(1, 1).await;
        assert_eq!(start.elapsed(), Duration::ZERO, "first two admit immediately");

        limiter.acquire(1, 1).await;
        assert_eq!(
            start.elapsed(),
            MINUTE,
            "third admission waits for the minute window"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_window_blocks_before_request_window() {
        let limiter = limiter(1_000, 10, 1_000_000_000);

        limiter.acquire(1, 8).await;
        let start = Instant::now();
        limiter.acquire(1, 8).await;
        assert_eq!(start.elapsed(), MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn day_window_blocks_for_a_day() {
        let limiter = limiter(1_000, 1_000_000, 10);

        limiter.acquire(1, 8).await;
        let start = Instant::now();
        limiter.acquire(1, 8).await;
        assert_eq!(start.elapsed(), DAY);
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_batch_admits_alone_in_fresh_window() {
        let limiter = limiter(1_000, 10, 1_000_000);

        // 50 tokens exceed the whole minute quota, but the window is empty.
        let start = Instant::now();
        limiter.acquire(1, 50).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next admission has to wait for the roll.
        limiter.acquire(1, 1).await;
        assert_eq!(start.elapsed(), MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let limiter = Arc::new(limiter(1, 1_000_000_000, 1_000_000_000));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // Stagger arrivals so the queue order is deterministic.
                sleep(Duration::from_millis(u64::from(i))).await;
                limiter.acquire(1, 1).await;
                order.lock().await.push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_never_exceeded_within_a_window() {
        let limiter = Arc::new(limiter(3, 1_000_000_000, 1_000_000_000));
        let start = Instant::now();

        let mut handles = Vec::new();
        for i in 0..7u32 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                sleep(Duration::from_millis(u64::from(i))).await;
                limiter.acquire(1, 1).await;
                Instant::now()
            }));
        }

        let mut admitted: Vec<Instant> = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        // At most 3 admissions within any window measured from its start.
        let windows: Vec<usize> = admitted
            .iter()
            .map(|t| (t.duration_since(start).as_secs() / 60) as usize)
            .collect();
        for w in 0..=2 {
            assert!(
                windows.iter().filter(|&&x| x == w).count() <= 3,
                "window {w} over quota: {windows:?}"
            );
        }
    }
}
