//! Retry and backoff logic for flux replication
//!
//! The transfer pipeline never retries on its own. Callers that want to
//! re-attempt a whole dataset transfer wrap it with [`retry_with_backoff`],
//! classifying each failure as transient or permanent.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use backoff::ExponentialBackoff;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Consume the error and return the underlying failure
    pub fn into_source(self) -> Box<dyn std::error::Error + Send + Sync> {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Execute an operation with a custom backoff policy
///
/// The closure receives the 1-based attempt number. Permanent errors stop
/// immediately and are returned as-is; transient errors are retried until
/// `max_attempts` is reached or the policy's elapsed-time budget runs out.
/// `max_attempts` counts the first attempt, so `1` means "no retries".
pub fn retry_with_backoff<F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    max_attempts: usize,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> RetryResult<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    policy.reset();

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt) {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}",
                    op_name, attempt
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}: {}",
                    op_name, attempt, err
                );

                if attempt >= max_attempts {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        source: err.into_source(),
                    });
                }

                let Some(delay) = policy.next_backoff() else {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        source: err.into_source(),
                    });
                };

                attempt += 1;
                std::thread::sleep(delay);
            }
        }
    }
}

/// Backoff policy for remote transfers over ssh
///
/// Transfers are long-lived, so the elapsed-time budget is unbounded and
/// only the attempt count limits retries.
pub fn transfer_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(2))
        .with_max_interval(Duration::from_secs(60))
        .with_max_elapsed_time(None)
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy with near-zero delays, for tests and local pipes
pub fn immediate_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(1))
        .with_max_interval(Duration::from_millis(1))
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Classify an error through [`RetryableError`] and wrap it accordingly
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}
