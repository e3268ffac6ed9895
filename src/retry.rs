//! Retry and backoff decisions for failed activity and sub-orchestration
//! attempts. Everything here is pure: the same policy, failure and attempt
//! always give the same answer, which keeps retry transitions replayable.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FailureDetails;

/// Predicate deciding whether a particular failure is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&FailureDetails) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff_coefficient must be a finite value >= 1.0, got {0}")]
    InvalidCoefficient(f64),
}

/// Bounded retry with exponential backoff.
///
/// Attempts are 1-indexed: attempt 1 is the original call. The delay before
/// attempt `n + 1` is `first_interval * backoff_coefficient^(n - 1)`.
///
/// ```
/// use std::time::Duration;
/// use dtf_core::RetryPolicy;
///
/// let policy = RetryPolicy::new(Duration::from_secs(5), 3).with_backoff_coefficient(3.0);
/// assert_eq!(policy.next_delay(1), Duration::from_secs(5));
/// assert_eq!(policy.next_delay(2), Duration::from_secs(15));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    pub first_interval: Duration,
    pub max_attempts: u32,
    pub backoff_coefficient: f64,
    pub max_interval: Option<Duration>,
    handle: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("first_interval", &self.first_interval)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_interval", &self.max_interval)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Panics if `max_attempts` is zero; use [`RetryPolicy::try_new`] for
    /// policies built from untrusted configuration.
    pub fn new(first_interval: Duration, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            first_interval,
            max_attempts,
            backoff_coefficient: 1.0,
            max_interval: None,
            handle: None,
        }
    }

    pub fn try_new(first_interval: Duration, max_attempts: u32) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        Ok(Self::new(first_interval, max_attempts))
    }

    /// Panics on a coefficient below 1.0 or a non-finite one.
    pub fn with_backoff_coefficient(self, coefficient: f64) -> Self {
        match self.try_with_backoff_coefficient(coefficient) {
            Ok(policy) => policy,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_with_backoff_coefficient(mut self, coefficient: f64) -> Result<Self, RetryPolicyError> {
        if !coefficient.is_finite() || coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidCoefficient(coefficient));
        }
        self.backoff_coefficient = coefficient;
        Ok(self)
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    /// Only failures for which `handle` returns true are retried.
    pub fn with_handle<P>(mut self, handle: P) -> Self
    where
        P: Fn(&FailureDetails) -> bool + Send + Sync + 'static,
    {
        self.handle = Some(Arc::new(handle));
        self
    }

    /// Re-check the invariants; fields are public and may have been edited.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidCoefficient(self.backoff_coefficient));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let base_ms = self.first_interval.as_millis() as f64;
        let scaled = base_ms * self.backoff_coefficient.powi(exponent.min(i32::MAX as u32) as i32);
        let delay = if scaled.is_finite() && scaled < u64::MAX as f64 {
            Duration::from_millis(scaled.round() as u64)
        } else {
            Duration::from_millis(u64::MAX)
        };
        match self.max_interval {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether attempt `attempt + 1` may run after `failure`.
    pub fn should_retry(&self, failure: &FailureDetails, attempt: u32) -> bool {
        attempt < self.max_attempts && self.handle.as_ref().is_none_or(|p| p(failure))
    }
}
