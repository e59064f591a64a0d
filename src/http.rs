//! Shared HTTP client construction and retry policy.
//!
//! Retry is a wrapper around the request, not a base type: callers hand over
//! a builder closure and get back a response or a typed failure. Retries
//! apply to 5xx, timeouts and connection errors only: 3 attempts with
//! exponential backoff between 2 and 30 seconds.

use crate::errors::ApiError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Client with the standard connect deadline; per-request read deadlines are
/// set by each service.
pub fn build_client(read_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(read_timeout)
        .user_agent("KaravanBot/1.0 (Autopost Pipeline)")
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << (attempt.saturating_sub(1)))
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// Execute a request with the standard retry policy.
///
/// `build` is called once per attempt so non-cloneable bodies (multipart
/// uploads) can be reconstructed.
pub async fn send_with_retry<F>(build: F, context: &str) -> Result<Response, ApiError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_error = ApiError::Transient(format!("{context}: no attempt made"));

    for attempt in 1..=MAX_ATTEMPTS {
        debug!("{} attempt {}/{}", context, attempt, MAX_ATTEMPTS);

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response);
                }

                // Upstream asked us to slow down; observe the hint and count
                // it as a failed attempt.
                if status == StatusCode::TOO_MANY_REQUESTS {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(BACKOFF_BASE_SECS)
                        .min(BACKOFF_CAP_SECS);
                    warn!("{} rate limited upstream, retry after {}s", context, retry_after);
                    last_error = ApiError::Transient(format!("{context}: 429 too many requests"));
                    if attempt < MAX_ATTEMPTS {
                        sleep(Duration::from_secs(retry_after)).await;
                    }
                    continue;
                }

                if status.is_server_error() {
                    warn!("{} got {} (attempt {})", context, status, attempt);
                    last_error = ApiError::Transient(format!("{context}: HTTP {status}"));
                    if attempt < MAX_ATTEMPTS {
                        sleep(backoff_delay(attempt)).await;
                    }
                    continue;
                }

                // 4xx: surface the body, no retry.
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Permanent {
                    status: status.as_u16(),
                    body: body.chars().take(500).collect(),
                });
            }
            Err(err) => {
                let mapped: ApiError = err.into();
                if !mapped.is_transient() {
                    return Err(mapped);
                }
                warn!("{} request failed (attempt {}): {}", context, attempt, mapped);
                last_error = mapped;
                if attempt < MAX_ATTEMPTS {
                    sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    Err(last_error)
}
