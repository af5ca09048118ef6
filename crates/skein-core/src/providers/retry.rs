//! Retry executor — uniform backoff around every provider call.
//!
//! Adapters never loop on their own: the dispatcher wraps each call in
//! [`with_retry`], which re-invokes the operation while the classifier says
//! the error is transient, sleeping with capped exponential backoff between
//! attempts. A wait hint embedded in the error text ("retry in 12s",
//! "retry after 3 seconds") replaces the computed backoff for that attempt.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Backoff policy for [`with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total invocations = max_retries + 1)
    pub max_retries: u32,
    /// Wait before the first retry
    #[serde(with = "duration_ms")]
    pub initial_wait: Duration,
    /// Multiplier applied to the wait after every retry
    pub factor: f64,
    /// Upper bound for the computed wait (server hints are not capped)
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_secs(1),
            factor: 2.0,
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn next_wait(&self, current: Duration) -> Duration {
        let scaled = current.mul_f64(self.factor.max(1.0));
        scaled.min(self.max_wait)
    }
}

/// Run `operation` until it succeeds, fails terminally, or the budget is spent.
///
/// `operation` receives the 1-based attempt number. Errors for which
/// `should_retry` returns false are returned unchanged after a single
/// invocation; exhausting the budget yields [`ProviderError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut, C>(
    mut operation: F,
    should_retry: C,
    policy: &RetryPolicy,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    C: Fn(&ProviderError) -> bool,
{
    let mut attempt: u32 = 0;
    let mut wait = policy.initial_wait;

    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }

        if attempt > policy.max_retries {
            return Err(ProviderError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = retry_hint(&err.message()).unwrap_or(wait);
        tracing::warn!(
            "[Retry] Attempt {}/{} failed ({}); retrying in {:?}",
            attempt,
            policy.max_retries + 1,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        wait = policy.next_wait(wait);
    }
}

/// Default classifier: rate limits, quotas and overloads are transient.
pub fn is_transient(err: &ProviderError) -> bool {
    match err {
        ProviderError::Transient { .. } => true,
        ProviderError::Terminal { message, .. } => has_transient_signature(message),
        _ => false,
    }
}

/// Whether an error message looks like a rate-limit/quota response.
pub fn has_transient_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    const SIGNATURES: &[&str] = &[
        "rate limit",
        "rate_limit",
        "ratelimit",
        "quota",
        "too many requests",
        "429",
        "resource_exhausted",
        "overloaded",
    ];
    SIGNATURES.iter().any(|s| lower.contains(s))
}

/// Extract a server-suggested wait from an error message.
pub fn retry_hint(message: &str) -> Option<Duration> {
    static HINT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = HINT_RE
        .get_or_init(|| {
            Regex::new(
                r"(?i)(?:retry|try again)\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?\b",
            )
            .ok()
        })
        .as_ref()?;

    let caps = re.captures(message)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase());
    let duration = match unit.as_deref() {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => {
            Duration::from_secs_f64(amount / 1000.0)
        }
        _ => Duration::from_secs_f64(amount),
    };
    Some(duration)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
