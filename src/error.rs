//! Error categorization and retry logic for remote store operations.
//!
//! Every store failure is a "remote operation failed" error carried as an
//! [`anyhow::Error`]; the category only decides whether another attempt
//! is worth making.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        // Config can carry a negative or NaN multiplier; hold the delay instead.
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        Duration::from_secs_f64(
            (delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error,
/// or the policy runs out of attempts. The closure receives the 1-based
/// attempt number.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation(attempts).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let category = categorize_error(&e);
                if !category.is_retryable() || attempts >= policy.max_attempts.max(1) {
                    if attempts > 1 {
                        return Err(
                            e.context(format!("operation failed after {attempts} attempts"))
                        );
                    }
                    return Err(e);
                }

                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?category,
                    "{e:#}; retrying in {delay:?}"
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

/// Marker error: a newer local write replaced this one before it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superseded;

impl fmt::Display for Superseded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("write superseded by a newer local edit")
    }
}

impl std::error::Error for Superseded {}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (retryable)
    Network,

    /// Timeout errors (retryable)
    Timeout,

    /// Storage backend errors (retryable)
    Storage,

    /// Rejected input (not retryable)
    Validation,

    /// Replaced by a newer write (not retryable)
    Superseded,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Storage
        )
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    if error.downcast_ref::<Superseded>().is_some() {
        return ErrorCategory::Superseded;
    }
    if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return ErrorCategory::Timeout;
    }

    let error_str = format!("{error:#}").to_lowercase();

    if error_str.contains("timed out") || error_str.contains("timeout") {
        ErrorCategory::Timeout
    } else if error_str.contains("invalid") || error_str.contains("rejected") {
        ErrorCategory::Validation
    } else if error_str.contains("network")
        || error_str.contains("connection")
        || error_str.contains("disconnected")
        || error_str.contains("websocket")
    {
        ErrorCategory::Network
    } else if error_str.contains("database") || error_str.contains("locked") {
        ErrorCategory::Storage
    } else {
        ErrorCategory::Unknown
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
