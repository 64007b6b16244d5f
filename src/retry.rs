//! Support utilities for [`keen_retry`]'s retry API.

use std::time::Duration;

use keen_retry::RetryResult;

use crate::config::WorkflowConfig;

/// On error, return a [`RetryResult::Transient`] value.
macro_rules! try_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                debug!("Potentially transient error: {}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_transient;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// How many times we try a step, and how long we wait in between.
///
/// Delays are a plain exponential backoff with no jitter, so a run's timing
/// is reproducible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delays before each retry. There are `max_attempts - 1` of them.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let Self {
            max_attempts,
            base_delay,
            max_delay,
        } = *self;
        (0..max_attempts.saturating_sub(1)).map(move |n| {
            base_delay
                .checked_mul(1u32.checked_shl(n).unwrap_or(u32::MAX))
                .unwrap_or(max_delay)
                .min(max_delay)
        })
    }
}

impl From<&WorkflowConfig> for RetryPolicy {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.retry_delay_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
        };
        let delays = policy.delays().map(|d| d.as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn single_attempt_means_no_retries() {
        let policy = RetryPolicy::from(&WorkflowConfig {
            max_attempts: 1,
            ..WorkflowConfig::default()
        });
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: 40,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delays().last(), Some(Duration::from_secs(10)));
    }
}
