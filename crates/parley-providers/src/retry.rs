use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Error fragments the Gemini API uses for conditions that clear up on their own.
const TRANSIENT_PATTERNS: [&str; 7] = [
    "resource_exhausted",
    "unavailable",
    "deadline_exceeded",
    "\"internal\"",
    "overloaded",
    "try again",
    "rate limit",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay_ms: INITIAL_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
        }
    }
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_initial_delay_ms() -> u64 {
    INITIAL_RETRY_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    MAX_RETRY_DELAY_MS
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for a zero-based retry attempt. A server supplied
    /// `Retry-After` raises the floor but is capped at one minute.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let base_ms = self.initial_delay_ms.saturating_mul(factor);
        let capped_ms = base_ms.min(self.max_delay_ms);
        let delay_ms = match retry_after_secs {
            Some(secs) => (secs.min(MAX_RETRY_AFTER_SECS) * 1000).max(capped_ms),
            None => capped_ms,
        };
        Duration::from_millis(delay_ms)
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

pub fn matches_transient_pattern(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// A 400 is a malformed request and stays failed no matter what its body says.
pub fn should_retry(status: u16, body: &str) -> bool {
    if is_retryable_status(status) {
        return true;
    }
    status != 400 && !is_auth_status(status) && matches_transient_pattern(body)
}

pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}
