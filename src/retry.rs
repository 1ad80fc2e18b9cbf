//! Bounded retries for remote model calls.
//!
//! Only network-class failures are retried. Anything else (bad request, auth,
//! malformed payload) surfaces on the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const NETWORK_KEYWORDS: &[&str] = &[
    "connection",
    "connect",
    "timeout",
    "timed out",
    "network",
    "ssl",
    "tls",
    "name resolution",
    "dns",
    "temporary failure",
    "service unavailable",
    "error sending request",
    "连接",
    "超时",
    "网络",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Classifies an error by its message text.
pub fn classify(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    if NETWORK_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * n`.
    #[serde(with = "crate::config::duration_secs")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Non-network failure, surfaced on the first attempt.
    #[error("{error:#}")]
    Fatal { error: E },
    /// Network failures on every attempt; `last` is the final one.
    #[error("gave up after {attempts} attempt(s): {last:#}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> GuardError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { .. } => 1,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal { error } => error,
            Self::Exhausted { last, .. } => last,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RetryGuard {
    policy: RetryPolicy,
}

impl RetryGuard {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `call` until it succeeds, fails with a non-network error, or the
    /// retry budget is spent.
    pub async fn guard<T, E, F, Fut>(&self, label: &str, mut call: F) -> Result<T, GuardError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                warn!(call = label, attempt, max_retries = self.policy.max_retries, "retrying remote call");
                tokio::time::sleep(self.policy.base_delay * attempt).await;
            }

            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if classify(&format!("{err:#}")) == ErrorClass::Fatal {
                warn!(call = label, error = %format!("{err:#}"), "remote call failed with non-network error");
                return Err(GuardError::Fatal { error: err });
            }

            warn!(call = label, attempt = attempt + 1, error = %format!("{err:#}"), "remote call failed");
            if attempt >= self.policy.max_retries {
                return Err(GuardError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }
            attempt += 1;
        }
    }
}
