//! HTTP retry helper for transient errors.
//!
//! Every call to the imagery service goes through [`send_with_retry`] so
//! rate limiting, server errors, and dropped connections are retried with
//! exponential backoff before a transfer is reported as failed.
//!
//! ```ignore
//! let response = retry::send_with_retry(&policy, || {
//!     client.post(&url).bearer_auth(&token).json(&payload)
//! })
//! .await?;
//! ```

use std::time::Duration;

use crate::TransferError;

/// Retry limits for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each subsequent retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// 5 retries waiting 2s, 4s, 8s, 16s, 32s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Whether a response status is worth retrying.
#[must_use]
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Sends the request built by `build_request`, retrying on transient
/// errors. Returns the first 2xx/3xx response.
///
/// `build_request` is called once per attempt because
/// [`reqwest::RequestBuilder`] is consumed by `send()`.
///
/// # Errors
///
/// Returns [`TransferError::Status`] for a 4xx other than 429, or for a
/// 429/5xx that persists past the retry limit. Returns
/// [`TransferError::Http`] for a non-transient transport error or one that
/// persists past the retry limit.
#[allow(clippy::future_not_send)]
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    build_request: F,
) -> Result<reqwest::Response, TransferError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_retries = policy.max_retries;
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    attempt += 1;
                    continue;
                }
                return Err(TransferError::Http(e));
            }
            Ok(response) => {
                let status = response.status();

                if is_retryable_status(status) && attempt < max_retries {
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        log::warn!("  HTTP 429 (rate limited)");
                    } else {
                        log::warn!("  HTTP {status} (server error)");
                    }
                    attempt += 1;
                    continue;
                }

                if status.is_client_error() || status.is_server_error() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TransferError::Status {
                        status: status.as_u16(),
                        body: truncate(&body, 500),
                    });
                }

                return Ok(response);
            }
        }
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn retries_rate_limit_and_server_errors_only() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(reqwest::StatusCode::OK));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ääää", 3), "ä...");
    }
}
