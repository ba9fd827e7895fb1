//! Bounded rounds × attempts retry policy
//!
//! Used twice: once for transport reconnects inside the protocol client and once
//! for full session restarts inside the orchestrator. Each owner keeps its own
//! [`RetryState`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before advancing to the next round
    pub max_attempts_per_round: u32,
    /// Rounds before giving up
    pub max_rounds: u32,
    /// Backoff unit; attempt `n` waits `2^n * backoff_base_ms`
    pub backoff_base_ms: u64,
    /// Upper bound on a single wait
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_round: 9,
            max_rounds: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 16_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based): `min(2^attempt * base, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(factor.saturating_mul(self.backoff_base_ms).min(self.backoff_cap_ms))
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again as `(round, attempt)`
    Retry { round: u32, attempt: u32, delay: Duration },
    /// Every round is spent
    Exhausted { rounds: u32 },
}

/// Progress through a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    round: u32,
}

impl RetryState {
    /// Start at round 1, attempt 1.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 1, round: 1 }
    }

    /// Record a failure and decide on the next step.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.round > self.policy.max_rounds || self.policy.max_attempts_per_round == 0 {
            return RetryDecision::Exhausted { rounds: self.policy.max_rounds };
        }

        let decision = RetryDecision::Retry {
            round: self.round,
            attempt: self.attempt,
            delay: self.policy.backoff(self.attempt),
        };

        self.attempt += 1;
        if self.attempt > self.policy.max_attempts_per_round {
            self.attempt = 1;
            self.round += 1;
        }
        decision
    }

    /// A success at any point resets to `{1, 1}`.
    pub fn reset(&mut self) {
        self.attempt = 1;
        self.round = 1;
    }

    /// Swap in a new policy, resetting progress.
    pub fn replace_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
        self.reset();
    }

    /// Current `(round, attempt)`.
    pub fn position(&self) -> (u32, u32) {
        (self.round, self.attempt)
    }

    /// Whether the next failure will be terminal.
    pub fn is_exhausted(&self) -> bool {
        self.round > self.policy.max_rounds
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts_per_round: 2,
            max_rounds: 2,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
        }
    }

    #[test]
    fn two_by_two_policy_stops_on_fifth_failure() {
        let mut state = RetryState::new(small_policy());

        let mut positions = Vec::new();
        for _ in 0..4 {
            match state.on_failure() {
                RetryDecision::Retry { round, attempt, .. } => positions.push([round, attempt]),
                RetryDecision::Exhausted { .. } => panic!("exhausted too early"),
            }
        }
        assert_eq!(positions, vec![[1, 1], [1, 2], [2, 1], [2, 2]]);
        assert_eq!(state.on_failure(), RetryDecision::Exhausted { rounds: 2 });
        assert_eq!(state.on_failure(), RetryDecision::Exhausted { rounds: 2 });
    }

    #[test]
    fn success_resets_progress() {
        let mut state = RetryState::new(small_policy());
        state.on_failure();
        state.on_failure();
        state.on_failure();
        assert_eq!(state.position(), (2, 2));

        state.reset();
        assert_eq!(state.position(), (1, 1));
        assert!(matches!(state.on_failure(), RetryDecision::Retry { round: 1, attempt: 1, .. }));
    }

    #[test]
    fn replacing_policy_resets() {
        let mut state = RetryState::new(small_policy());
        state.on_failure();
        state.replace_policy(RetryPolicy::default());
        assert_eq!(state.position(), (1, 1));
        assert_eq!(state.policy().max_attempts_per_round, 9);
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy { backoff_cap_ms: 10_000, ..small_policy() };
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff(4), Duration::from_millis(10_000));
        assert_eq!(policy.backoff(80), Duration::from_millis(10_000));
    }

    proptest! {
        #[test]
        fn total_retries_equal_rounds_times_attempts(attempts in 1u32..12, rounds in 1u32..6) {
            let policy = RetryPolicy {
                max_attempts_per_round: attempts,
                max_rounds: rounds,
                ..RetryPolicy::default()
            };
            let mut state = RetryState::new(policy);

            let mut retries = 0;
            while let RetryDecision::Retry { delay, .. } = state.on_failure() {
                prop_assert!(delay <= Duration::from_millis(policy.backoff_cap_ms));
                retries += 1;
            }
            prop_assert_eq!(retries, attempts * rounds);
        }
    }
}
