// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rate-limit extraction and retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::WorkSourceError;

// ─── Rate limit info ──────────────────────────────────────────────────────────

/// Provider rate-limit state extracted from response headers on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset: Option<DateTime<Utc>>,
    pub resource: Option<String>,
}

impl RateLimitInfo {
    /// Parse the `X-RateLimit-*` header family. Returns `None` when the
    /// limit header is absent (non-rate-limited endpoint).
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let parse = |name: &str| -> Option<u64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        };
        let limit = parse("x-ratelimit-limit")?;
        let remaining = parse("x-ratelimit-remaining").unwrap_or(0);
        let reset = parse("x-ratelimit-reset")
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
        let resource = headers
            .get("x-ratelimit-resource")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Some(Self {
            limit,
            remaining,
            reset,
            resource,
        })
    }

    /// A response is a rate-limit error when it is a 429, or a 403 with the
    /// remaining quota exhausted.
    pub fn classifies_as_rate_limit(status: u16, remaining: Option<u64>) -> bool {
        status == 429 || (status == 403 && remaining == Some(0))
    }
}

// ─── Backoff policy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fraction of the computed delay added as random jitter (0 = none).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// Exponential `base · 2^attempt` capped at `max_delay`. When the
    /// provider told us its reset time, wait at least until one second past
    /// it (still capped), because retrying earlier is guaranteed to fail.
    pub fn delay_for(&self, attempt: u32, reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let mut delay = exp;
        if let Some(reset) = reset {
            let until_reset = (reset - now).to_std().unwrap_or(Duration::ZERO);
            let with_buffer = until_reset + Duration::from_secs(1);
            delay = delay.max(with_buffer).min(self.max_delay);
        }

        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..self.jitter);
            let jittered = delay.mul_f64(1.0 + factor);
            delay = jittered.min(self.max_delay);
        }
        delay
    }
}

/// Run `op` with retries under `policy`.
///
/// Retries are taken only on classified rate-limit errors, network errors,
/// and 5xx source errors; permanent failures (401/403/404 mappings) are
/// returned immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, WorkSourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkSourceError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let reset = match &err {
                    WorkSourceError::RateLimited { reset } => *reset,
                    _ => None,
                };
                let delay = policy.delay_for(attempt, reset, Utc::now());
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying work-source call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(op = op_name, error = %err, "work-source call failed");
                return Err(err);
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
