//! Per-step retry policy

use std::collections::BTreeMap;
use std::time::Duration;

use crate::workflow::Step;

/// Retry configuration for a single workflow step.
///
/// Backoff doubles per attempt (`base * 2^(attempt-1)`) and is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub backoff_base: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait before retry number `attempt + 1`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exponent));
        scaled.min(self.max_backoff)
    }
}

/// Retry policies for every step of the pipeline.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policies: BTreeMap<Step, RetryPolicy>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(Step::Receive, RetryPolicy::new(1, Duration::ZERO));
        policies.insert(Step::Plan, RetryPolicy::new(2, Duration::from_secs(2)));
        policies.insert(Step::Retrieve, RetryPolicy::new(3, Duration::from_secs(5)));
        policies.insert(Step::Respond, RetryPolicy::new(3, Duration::from_secs(5)));
        policies.insert(Step::Verify, RetryPolicy::new(2, Duration::from_secs(2)));
        policies.insert(Step::MaybeApprove, RetryPolicy::new(1, Duration::ZERO));
        policies.insert(Step::Finalize, RetryPolicy::new(1, Duration::ZERO));
        Self { policies }
    }
}

impl RetrySchedule {
    pub fn policy_for(&self, step: Step) -> RetryPolicy {
        self.policies
            .get(&step)
            .copied()
            .unwrap_or(RetryPolicy::new(1, Duration::ZERO))
    }

    /// Replace the policy for one step.
    pub fn set(&mut self, step: Step, policy: RetryPolicy) {
        self.policies.insert(step, policy);
    }

    pub fn with_policy(mut self, step: Step, policy: RetryPolicy) -> Self {
        self.set(step, policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy::new(20, Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(12), Duration::from_secs(60));
    }

    #[test]
    fn test_default_schedule() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.policy_for(Step::Receive).max_attempts, 1);
        assert_eq!(schedule.policy_for(Step::Respond).max_attempts, 3);
        assert_eq!(
            schedule.policy_for(Step::Respond).backoff_base,
            Duration::from_secs(5)
        );
    }
}
