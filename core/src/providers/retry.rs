//! Retry policy for provider calls.
//!
//! Transient classes (429, 5xx, timeout, network) retry with exponential
//! backoff plus jitter; a server hint overrides the computed delay. Auth
//! and validation failures never retry.

use rand::Rng;
use std::time::Duration;

use super::hints::RetryHint;
use super::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub used_hint: bool,
}

impl RetryDecision {
    const fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
            used_hint: false,
        }
    }
}

/// Decide whether another attempt is warranted.
///
/// `completed_attempts` counts attempts already made, so the first failure
/// arrives with `completed_attempts == 1`.
pub fn evaluate_retry(
    error: &ProviderError,
    policy: &RetryPolicy,
    completed_attempts: u32,
) -> RetryDecision {
    if completed_attempts >= policy.max_attempts || !error.is_transient() {
        return RetryDecision::give_up();
    }

    if let Some(hint) = error.retry_hint() {
        return RetryDecision {
            should_retry: true,
            delay: hint.clamped_delay().min(policy.max_delay),
            used_hint: true,
        };
    }

    let delay = backoff_with_jitter(policy, completed_attempts);
    RetryDecision {
        should_retry: true,
        delay,
        used_hint: false,
    }
}

/// `base · 2^attempt` capped at `max_delay`, plus uniform jitter.
fn backoff_with_jitter(policy: &RetryPolicy, completed_attempts: u32) -> Duration {
    let exponent = completed_attempts.saturating_sub(1).min(10);
    let multiplier = 1u64 << exponent;
    let base_ms = policy.base_delay.as_millis() as u64;
    let backoff_ms = base_ms.saturating_mul(multiplier);
    let capped = Duration::from_millis(backoff_ms).min(policy.max_delay);

    let jitter_ms = policy.jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return capped;
    }
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::super::ProviderId;
    use super::*;
    use crate::providers::hints::HintSource;

    fn rate_limited(hint: Option<RetryHint>) -> ProviderError {
        ProviderError::RateLimited {
            provider: ProviderId::OpenAi,
            message: "slow down".into(),
            retry_hint: hint,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: Duration::from_millis(250),
        }
    }

    #[test]
    fn hint_overrides_computed_backoff() {
        let error = rate_limited(Some(RetryHint {
            delay: Duration::from_secs(19),
            source: HintSource::RetryAfterHeader,
        }));
        let decision = evaluate_retry(&error, &policy(), 1);
        assert!(decision.should_retry);
        assert!(decision.used_hint);
        assert_eq!(decision.delay, Duration::from_secs(19));
    }

    #[test]
    fn backoff_doubles_within_jitter_window() {
        let error = rate_limited(None);
        let policy = policy();

        let first = evaluate_retry(&error, &policy, 1);
        let second = evaluate_retry(&error, &policy, 2);

        assert!(first.should_retry && second.should_retry);
        assert!(first.delay >= Duration::from_millis(500));
        assert!(first.delay <= Duration::from_millis(750));
        assert!(second.delay >= Duration::from_millis(1000));
        assert!(second.delay <= Duration::from_millis(1250));
    }

    #[test]
    fn stops_after_max_attempts() {
        let error = rate_limited(None);
        let decision = evaluate_retry(&error, &policy(), 3);
        assert!(!decision.should_retry);
    }

    #[test]
    fn fatal_errors_never_retry() {
        let error = ProviderError::Unauthorized {
            provider: ProviderId::Anthropic,
            message: "bad key".into(),
        };
        let decision = evaluate_retry(&error, &policy(), 1);
        assert!(!decision.should_retry);
    }

    #[test]
    fn oversized_hint_is_capped_by_policy() {
        let error = rate_limited(Some(RetryHint {
            delay: Duration::from_secs(600),
            source: HintSource::RetryAfterHeader,
        }));
        let decision = evaluate_retry(&error, &policy(), 1);
        // Hints clamp to 60s, then to the policy max.
        assert!(decision.delay <= Duration::from_secs(30));
    }
}
