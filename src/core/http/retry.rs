//! Bounded retry with exponential backoff and jitter.

use super::transport::{Request, Response, Transport};
use crate::cancel::CancellationToken;
use crate::error::{Error, ErrorCode, Result};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 15;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Non-2xx statuses that are retried like network errors.
    pub retry_statuses: Vec<u16>,
    /// Interrupts the backoff sleep; the pending request is not retried.
    pub cancel: Option<CancellationToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_statuses: Vec::new(),
            cancel: None,
        }
    }
}

impl RetryPolicy {
    /// Interpret a configured `maxRetries`: `-1` (or any negative) disables
    /// retries, `0` selects the default.
    pub fn from_max_retries(configured: i64) -> Self {
        let max_retries = match configured {
            n if n < 0 => 0,
            0 => DEFAULT_MAX_RETRIES,
            n => u32::try_from(n).unwrap_or(u32::MAX),
        };
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::from_max_retries(-1)
    }
}

pub fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}

/// Add up to 50% random jitter.
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 2) as u64;
    if spread == 0 {
        return delay;
    }
    let random = (uuid::Uuid::new_v4().as_u128() & u64::MAX as u128) as u64;
    delay + Duration::from_millis(random % (spread + 1))
}

/// Send with retries. Network errors are retried for idempotent methods only;
/// responses with a whitelisted status are retried for any method. Any other
/// response is returned as-is, whatever its status.
pub fn send_with_retry(
    transport: &dyn Transport,
    request: &Request,
    policy: &RetryPolicy,
    redact: &dyn Fn(&str) -> String,
) -> Result<Response> {
    let mut attempt: u32 = 0;
    let mut backoff = policy.min_backoff;

    loop {
        attempt += 1;
        let exhausted = attempt > policy.max_retries;

        match transport.send(request) {
            Ok(response) => {
                if exhausted || !policy.retry_statuses.contains(&response.status) {
                    return Ok(response);
                }
                tracing::warn!(
                    method = %request.method,
                    url = %redact(&request.url),
                    status = response.status,
                    attempt,
                    "retrying after retryable status"
                );
            }
            Err(err) => {
                let retryable = err.code == ErrorCode::HttpTransportFailed && request.is_idempotent();
                if exhausted || !retryable {
                    return Err(Error::http_transport(
                        request.method.as_str(),
                        redact(&request.url),
                        redact(&transport_reason(&err)),
                        attempt,
                    ));
                }
                tracing::warn!(
                    method = %request.method,
                    url = %redact(&request.url),
                    attempt,
                    error = %redact(&transport_reason(&err)),
                    "request failed, retrying"
                );
            }
        }

        let delay = with_jitter(backoff);
        let cancelled = match &policy.cancel {
            Some(token) => token.sleep(delay),
            None => {
                std::thread::sleep(delay);
                false
            }
        };
        if cancelled {
            return Err(Error::http_transport(
                request.method.as_str(),
                redact(&request.url),
                "cancelled while waiting to retry",
                attempt,
            ));
        }
        backoff = next_backoff(backoff, policy.max_backoff);
    }
}

fn transport_reason(err: &Error) -> String {
    err.details
        .get("error")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.message.clone())
}
