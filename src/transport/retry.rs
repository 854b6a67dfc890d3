//! Retry-with-backoff wrapping the adaptive rate limiter.
//!
//! Implements the exact policy from spec §4.4: exponential backoff with
//! jitter, capped at a maximum, `Retry-After` honored when it exceeds the
//! computed backoff, and retry-safe body replay via a caller-supplied
//! factory (never via an in-memory copy, so mmapped/streaming bodies stay
//! cheap to retry).

use super::rate_limit::RateLimiter;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        408 | 429 | 500 | 502 | 503 | 504 | 507
    )
}

fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.as_secs_f64() * config.multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff.as_secs_f64());
    let jitter_span = capped * config.jitter;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

/// Parse a `Retry-After` header value: either delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let target = httpdate::parse_http_date(value.trim()).ok()?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok()
}

/// A fresh, replayable request body. Each retry attempt calls this to get a
/// brand new byte source rather than reusing/copying one, so large
/// mmapped or streaming bodies never get materialized onto the heap just
/// to support retries.
pub trait BodyFactory: Send + Sync {
    fn make_body(&self) -> reqwest::Body;
}

impl BodyFactory for Vec<u8> {
    fn make_body(&self) -> reqwest::Body {
        reqwest::Body::from(self.clone())
    }
}

/// Execute `send` (which performs one HTTP attempt) with retry, backoff,
/// `Retry-After` honoring, and rate-limiter feedback.
///
/// `send` is called once per attempt; it must apply `body_factory` (if the
/// request carries a body) itself before sending, since only the caller
/// knows how to attach a body to its own request builder.
pub async fn with_retry<F, Fut>(
    limiter: &RateLimiter,
    config: &RetryConfig,
    has_body: bool,
    body_factory: Option<&dyn BodyFactory>,
    mut send: F,
) -> anyhow::Result<reqwest::Response>
where
    F: FnMut(Option<reqwest::Body>) -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    if has_body && body_factory.is_none() {
        anyhow::bail!("no-replayable-body");
    }

    let mut attempt = 0u32;
    loop {
        limiter.acquire().await;

        let body = body_factory.map(|f| f.make_body());
        let result = send(body).await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    limiter.record_success();
                    return Ok(response);
                }

                if status.as_u16() == 429 || status.as_u16() == 503 {
                    limiter.record_throttle();
                } else if !status.is_server_error() {
                    limiter.record_neutral();
                }

                if !is_retryable_status(status) || attempt + 1 >= config.max_attempts {
                    return Err(anyhow::anyhow!(
                        "transport-failed: request failed with status {status} after {} attempt(s)",
                        attempt + 1
                    ));
                }

                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);

                let backoff = compute_backoff(config, attempt);
                let wait = match retry_after {
                    Some(ra) if ra > backoff => ra,
                    _ => backoff,
                };

                warn!(%status, attempt, wait_ms = wait.as_millis() as u64, "retrying after error response");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    if attempt + 1 >= config.max_attempts {
                        return Err(anyhow::anyhow!("transport-failed: {err}"));
                    }
                    let backoff = compute_backoff(config, attempt);
                    debug!(%err, attempt, wait_ms = backoff.as_millis() as u64, "retrying after transport error");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                } else {
                    return Err(anyhow::anyhow!("transport-failed: {err}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec() {
        for code in [408, 429, 500, 502, 503, 504, 507] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404, 409] {
            assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn backoff_is_capped_and_nonnegative() {
        let config = RetryConfig { max_backoff: Duration::from_secs(5), ..RetryConfig::default() };
        for attempt in 0..20 {
            let backoff = compute_backoff(&config, attempt);
            assert!(backoff <= Duration::from_secs(5) + Duration::from_secs_f64(5.0 * config.jitter));
        }
    }

    #[test]
    fn parses_delta_seconds_retry_after() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn parses_http_date_retry_after() {
        let future = std::time::SystemTime::now() + Duration::from_secs(120);
        let header_value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header_value).unwrap();
        // Allow a little slack for test execution time.
        assert!(parsed.as_secs() >= 110 && parsed.as_secs() <= 130);
    }

    #[tokio::test]
    async fn body_bearing_request_without_factory_fails_fast() {
        let limiter = RateLimiter::new(Default::default());
        let config = RetryConfig::default();
        let result = with_retry(&limiter, &config, true, None, |_| async {
            panic!("send should never be called without a replayable body")
        })
        .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no-replayable-body"));
    }
}
