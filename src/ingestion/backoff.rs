//! Retry policy and the per-call backoff state machine.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::ConfigError;

/// Randomisation applied to each computed delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exponential delay as is.
    None,
    /// Half the delay is fixed, the other half is uniformly random.
    #[default]
    Equal,
}

/// Parameters controlling the retry curve.
///
/// The delay before retry `n` (zero based) is `min(base * 2^n, cap)`,
/// jittered, and never shorter than the delay before retry `n - 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(20 * 60),
            max_retries: 3,
            jitter: Jitter::Equal,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base.is_zero() {
            return Err(ConfigError::Invalid("retry base must be greater than zero".into()));
        }
        if self.cap < self.base {
            return Err(ConfigError::Invalid(format!(
                "retry cap {:?} is shorter than base {:?}",
                self.cap, self.base
            )));
        }
        Ok(())
    }
}

/// Tracks the retries of one call and produces its delays.
pub struct BackoffState {
    policy: RetryPolicy,
    retries: u32,
    previous: Duration,
    rng: StdRng,
}

impl BackoffState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic state for tests and benchmarks.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            retries: 0,
            previous: Duration::ZERO,
            rng,
        }
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        let exponential = self.policy.base.saturating_mul(factor).min(self.policy.cap);
        let jittered = match self.policy.jitter {
            Jitter::None => exponential,
            Jitter::Equal => {
                let max_ms = exponential.as_millis().min(u128::from(u64::MAX)) as u64;
                let half = max_ms / 2;
                Duration::from_millis(max_ms - half + self.rng.gen_range(0..=half))
            }
        };
        let delay = jittered.max(self.previous);
        self.previous = delay;
        self.retries += 1;
        Some(delay)
    }
}
