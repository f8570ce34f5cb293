//! Retry policies for retryable failures.
//!
//! A [`RetryPolicy`] pairs a maximum attempt count with a [`Backoff`]
//! schedule. The runner applies its policy around whole dispatches; the
//! sequential and loop orchestrators apply theirs per step so a retried
//! handler never re-runs its predecessors.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default(); // exponential: 1s, 2s, 4s … capped at 30s
//! assert_eq!(policy.max_retries, 3);
//! assert_eq!(policy.delay(0), Duration::from_secs(1));
//! assert_eq!(policy.delay(1), Duration::from_secs(2));
//! assert_eq!(policy.delay(10), Duration::from_secs(30)); // cap
//!
//! let fixed = RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(250)));
//! assert_eq!(fixed.delay(5), Duration::from_millis(250));
//! ```

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// `base * factor^attempt`, capped.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Multiplier applied per attempt.
        factor: u32,
        /// Upper bound on any single delay.
        cap: Duration,
    },
    /// `step * (attempt + 1)`, capped.
    Linear {
        /// Increment added per attempt.
        step: Duration,
        /// Upper bound on any single delay.
        cap: Duration,
    },
    /// The same delay for every attempt.
    Fixed(Duration),
}

/// How many times to retry and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and backoff.
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed(Duration::ZERO))
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Exponential { base, factor, cap } => {
                let factor = factor.saturating_pow(attempt);
                let delay = base.saturating_mul(factor);
                delay.min(*cap)
            }
            Backoff::Linear { step, cap } => {
                let delay = step.saturating_mul(attempt.saturating_add(1));
                delay.min(*cap)
            }
            Backoff::Fixed(delay) => *delay,
        }
    }
}

impl Default for RetryPolicy {
    /// Exponential backoff: base 1 s, factor 2, cap 30 s, three retries.
    fn default() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_secs(1),
                factor: 2,
                cap: Duration::from_secs(30),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(31), Duration::from_secs(30)); // overflow-safe
    }

    #[test]
    fn linear_schedule() {
        let policy = RetryPolicy::new(
            5,
            Backoff::Linear {
                step: Duration::from_secs(2),
                cap: Duration::from_secs(5),
            },
        );
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(5));
    }

    #[test]
    fn none_policy_has_no_budget() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay(0), Duration::ZERO);
    }
}
