//! Retry control for outbound calls.
//!
//! Each attempt ends in exactly one [`RetryDecision`]: either the caller
//! sleeps for the returned delay and tries again, or it gives up and
//! surfaces the last failure.

use rand::Rng;
use std::time::Duration;

const MAX_BACKOFF_SECS: u64 = 30;
const MAX_JITTER_MS: u64 = 250;
const DEFAULT_RETRY_AFTER_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Added on top of the server's `Retry-After`
    pub retry_after_margin: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_after_margin: Duration::from_millis(900),
        }
    }
}

/// A retryable failure observed on one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransientFailure {
    RateLimited { retry_after: Option<String> },
    Server { status: u16 },
    Network,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Zero-based index of the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retries_left(&self) -> u32 {
        self.policy.max_retries.saturating_sub(self.attempt)
    }

    /// Record a failed attempt and decide what happens next.
    pub fn on_failure(&mut self, failure: &TransientFailure) -> RetryDecision {
        if self.attempt >= self.policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = match failure {
            TransientFailure::RateLimited { retry_after } => {
                let secs = parse_retry_after(retry_after.as_deref());
                Duration::from_secs_f64(secs) + self.policy.retry_after_margin
            }
            TransientFailure::Server { .. } | TransientFailure::Network => backoff_delay(self.attempt),
        };
        self.attempt += 1;
        RetryDecision::RetryAfter(delay)
    }
}

/// `Retry-After` in seconds. Missing or unparseable values fall back to 1s.
pub fn parse_retry_after(value: Option<&str>) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.max(DEFAULT_RETRY_AFTER_SECS))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Capped exponential backoff `min(2^attempt, 30)s` plus up to 250ms jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.checked_pow(attempt).unwrap_or(u64::MAX).min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
    Duration::from_secs(base) + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_honors_header_plus_margin() {
        let mut state = RetryState::new(RetryPolicy::default());
        let decision = state.on_failure(&TransientFailure::RateLimited {
            retry_after: Some("2".to_string()),
        });
        assert_eq!(decision, RetryDecision::RetryAfter(Duration::from_millis(2900)));
        assert_eq!(state.attempt(), 1);
    }

    #[test]
    fn test_retry_after_fallback() {
        assert_eq!(parse_retry_after(None), 1.0);
        assert_eq!(parse_retry_after(Some("soon")), 1.0);
        assert_eq!(parse_retry_after(Some("0")), 1.0);
        assert_eq!(parse_retry_after(Some(" 7 ")), 7.0);
    }

    #[test]
    fn test_backoff_is_capped_with_jitter() {
        for attempt in 0..8 {
            let delay = backoff_delay(attempt);
            let base = Duration::from_secs(2u64.pow(attempt).min(30));
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(250));
        }
        assert!(backoff_delay(64) <= Duration::from_millis(30_250));
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut state = RetryState::new(RetryPolicy {
            max_retries: 2,
            retry_after_margin: Duration::ZERO,
        });
        assert!(matches!(state.on_failure(&TransientFailure::Network), RetryDecision::RetryAfter(_)));
        assert!(matches!(
            state.on_failure(&TransientFailure::Server { status: 503 }),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(state.retries_left(), 0);
        assert_eq!(state.on_failure(&TransientFailure::Network), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_never_sleeps() {
        let mut state = RetryState::new(RetryPolicy {
            max_retries: 0,
            retry_after_margin: Duration::ZERO,
        });
        assert_eq!(state.on_failure(&TransientFailure::Network), RetryDecision::GiveUp);
    }
}
