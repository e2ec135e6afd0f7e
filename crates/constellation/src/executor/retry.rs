//! Retry/backoff arithmetic (`spec.md` §4.8 step 5).
//!
//! Pure functions only; the scheduler owns the actual delay (sleeping,
//! cancellation-aware waiting) and per-module attempt counters.

use std::time::Duration;

use crate::dag::BackoffStrategy;

/// Delay before the `attempt`th retry (1-indexed: `attempt = 1` is the
/// first retry, i.e. the second call overall). `Fixed` is constant;
/// `Linear` scales with attempt number; `Exponential` doubles each attempt,
/// capped at `max_delay`.
pub fn backoff_delay(strategy: BackoffStrategy, base_delay: Duration, attempt: u32, max_delay: Duration) -> Duration {
    let attempt = attempt.max(1);
    let delay = match strategy {
        BackoffStrategy::Fixed => base_delay,
        BackoffStrategy::Linear => base_delay.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            base_delay.saturating_mul(factor)
        }
    };
    delay.min(max_delay)
}

/// Per-module retry bookkeeping: how many attempts have run, and how many
/// are still allowed (`spec.md` §8 property 7: "invoked at most n + 1
/// times").
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub attempts_made: u32,
}

impl RetryState {
    pub fn has_retries_left(&self, retry_limit: u32) -> bool {
        self.attempts_made <= retry_limit
    }

    pub fn record_attempt(&mut self) {
        self.attempts_made += 1;
    }

    /// 1-indexed attempt number to feed `backoff_delay` for the *next*
    /// attempt, given that `attempts_made` attempts have already run.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempts_made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let d = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(BackoffStrategy::Fixed, d, 1, cap), d);
        assert_eq!(backoff_delay(BackoffStrategy::Fixed, d, 5, cap), d);
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let d = Duration::from_millis(100);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(BackoffStrategy::Linear, d, 3, cap), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let d = Duration::from_millis(100);
        let cap = Duration::from_millis(350);
        assert_eq!(backoff_delay(BackoffStrategy::Exponential, d, 1, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(BackoffStrategy::Exponential, d, 2, cap), Duration::from_millis(200));
        // 4th attempt would be 800ms uncapped; must clamp to max_delay.
        assert_eq!(backoff_delay(BackoffStrategy::Exponential, d, 4, cap), cap);
    }

    #[test]
    fn retry_state_tracks_remaining_attempts() {
        let mut state = RetryState::default();
        assert!(state.has_retries_left(2));
        state.record_attempt();
        assert!(state.has_retries_left(2));
        state.record_attempt();
        assert!(state.has_retries_left(2));
        state.record_attempt();
        assert!(!state.has_retries_left(2));
        assert_eq!(state.attempts_made, 3);
    }
}
