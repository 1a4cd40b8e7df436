//! Retry with exponential backoff
//!
//! `retry` runs an async operation up to `max_retries + 1` times, sleeping
//! `min(initial_delay * backoff_factor^(attempt - 1), max_delay)` between
//! attempts. An optional allow-list restricts which error messages are retried.

use crate::config::RetryConfig;
use regex::Regex;
use std::future::Future;
use std::time::Duration;

/// Matches an error message against an allow-list entry
#[derive(Debug, Clone)]
pub enum RetryMatcher {
    /// The message contains this text
    Substring(String),
    /// The message matches this pattern
    Pattern(Regex),
}

impl RetryMatcher {
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RetryMatcher::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, message: &str) -> bool {
        match self {
            RetryMatcher::Substring(text) => message.contains(text.as_str()),
            RetryMatcher::Pattern(re) => re.is_match(message),
        }
    }
}

impl From<&str> for RetryMatcher {
    fn from(text: &str) -> Self {
        RetryMatcher::Substring(text.to_string())
    }
}

impl From<Regex> for RetryMatcher {
    fn from(re: Regex) -> Self {
        RetryMatcher::Pattern(re)
    }
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// When set, only errors matching one of these are retried
    pub retryable_errors: Option<Vec<RetryMatcher>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_factor: 2.0,
            retryable_errors: None,
        }
    }
}

impl From<&RetryConfig> for RetryOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            retryable_errors: None,
        }
    }
}

impl RetryOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn retry_on<M: Into<RetryMatcher>>(mut self, matcher: M) -> Self {
        self.retryable_errors
            .get_or_insert_with(Vec::new)
            .push(matcher.into());
        self
    }

    fn is_retryable(&self, message: &str) -> bool {
        match &self.retryable_errors {
            Some(matchers) => matchers.iter().any(|m| m.matches(message)),
            None => true,
        }
    }
}

/// Delay before the next attempt after the `attempt`-th failure (1-based)
pub fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = options.initial_delay.as_secs_f64() * options.backoff_factor.powi(exponent);
    let cap = options.max_delay.as_secs_f64();

    if !secs.is_finite() || secs >= cap {
        options.max_delay
    } else if secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Run `operation` until it succeeds, the attempts run out, or it fails with
/// an error the allow-list does not cover. The last error is returned as is.
pub async fn retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let message = error.to_string();
        if !options.is_retryable(&message) {
            tracing::debug!("Error is not retryable, giving up: {}", message);
            return Err(error);
        }

        if attempt > options.max_retries {
            tracing::warn!("Giving up after {} attempts: {}", attempt, message);
            return Err(error);
        }

        let delay = backoff_delay(options, attempt);
        tracing::debug!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt,
            message,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
