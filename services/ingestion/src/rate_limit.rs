use std::{collections::HashMap, time::{Duration, Instant}};

/// Fixed-window rate limit. Finalization uses a stricter policy than routine
/// telemetry sync because it triggers scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_calls: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max_calls: u32, window: Duration) -> Self {
        Self { max_calls, window }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started_at: Instant,
    count: u32,
}

const PRUNE_THRESHOLD: usize = 4_096;

/// Per-key fixed windows. Keys are caller identities (session token, falling
/// back to client address). Rejected calls do not consume budget.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    policy: RateLimitPolicy,
    windows: HashMap<String, WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: HashMap::new(),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// `Ok` consumes one call from the key's window; `Err` carries how long
    /// the caller must wait, in milliseconds.
    pub fn check(&mut self, key: &str, now: Instant) -> Result<(), u64> {
        if self.windows.len() >= PRUNE_THRESHOLD {
            let window = self.policy.window;
            self.windows
                .retain(|_, state| now.duration_since(state.started_at) < window);
        }

        let state = self
            .windows
            .entry(key.to_string())
            .or_insert(WindowState {
                started_at: now,
                count: 0,
            });
        if now.duration_since(state.started_at) >= self.policy.window {
            state.started_at = now;
            state.count = 0;
        }
        if state.count >= self.policy.max_calls {
            let elapsed = now.duration_since(state.started_at);
            let remaining = self.policy.window.saturating_sub(elapsed);
            return Err(remaining.as_millis().max(1) as u64);
        }
        state.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects_with_a_hint() {
        let mut limiter =
            FixedWindowLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(10)));
        let now = Instant::now();
        assert!(limiter.check("k", now).is_ok());
        assert!(limiter.check("k", now).is_ok());
        let retry_after = limiter.check("k", now).unwrap_err();
        assert!(retry_after > 0);
        assert!(retry_after <= 10_000);
    }

    #[test]
    fn keys_have_independent_windows() {
        let mut limiter =
            FixedWindowLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(10)));
        let now = Instant::now();
        assert!(limiter.check("a", now).is_ok());
        assert!(limiter.check("b", now).is_ok());
        assert!(limiter.check("a", now).is_err());
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let mut limiter =
            FixedWindowLimiter::new(RateLimitPolicy::new(1, Duration::from_millis(100)));
        let start = Instant::now();
        assert!(limiter.check("k", start).is_ok());
        assert!(limiter.check("k", start).is_err());
        assert!(limiter.check("k", start + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn rejected_calls_do_not_extend_the_window() {
        let mut limiter =
            FixedWindowLimiter::new(RateLimitPolicy::new(1, Duration::from_millis(100)));
        let start = Instant::now();
        assert!(limiter.check("k", start).is_ok());
        for offset in [10_u64, 20, 30] {
            assert!(
                limiter
                    .check("k", start + Duration::from_millis(offset))
                    .is_err()
            );
        }
        assert!(limiter.check("k", start + Duration::from_millis(120)).is_ok());
    }
}
