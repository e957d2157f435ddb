//! Per-email limiter for OTP and password-reset requests.
//! Counter is bumped before the check, so request #6 in a window is the first one refused.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
#[cfg(test)]
use std::collections::HashMap;
use std::sync::Arc;
#[cfg(test)]
use tokio::sync::RwLock;

pub const WINDOW_MINUTES: i64 = 15;
pub const MAX_REQUESTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    pub request_count: i64,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub wait_minutes: i64,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait_minutes: 0,
        }
    }
}

/// Window storage. `record_request` must, in one atomic step, start a window for a new
/// email, restart one older than `window` at a count of 1, or increment the count.
#[async_trait]
pub trait RequestWindowStore: Send + Sync {
    async fn record_request(
        &self,
        email: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RequestWindow>;
    async fn clear(&self, email: &str) -> Result<()>;
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone)]
pub struct OtpRateLimiter {
    store: Arc<dyn RequestWindowStore>,
    max_requests: i64,
    window: Duration,
}

impl OtpRateLimiter {
    pub fn new(store: Arc<dyn RequestWindowStore>) -> Self {
        Self {
            store,
            max_requests: MAX_REQUESTS,
            window: Duration::minutes(WINDOW_MINUTES),
        }
    }

    pub async fn check_request(&self, email: &str, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let record = self.store.record_request(email, now, self.window).await?;

        let elapsed_minutes = (now - record.window_start).num_milliseconds() as f64 / 60_000.0;
        let window_minutes = self.window.num_minutes() as f64;

        if record.request_count > self.max_requests {
            let wait_minutes = (window_minutes - elapsed_minutes).ceil() as i64;
            tracing::warn!(
                "OTP rate limit exceeded for {} ({} requests, retry in {} min)",
                email,
                record.request_count,
                wait_minutes
            );
            return Ok(RateLimitDecision {
                allowed: false,
                wait_minutes,
            });
        }

        Ok(RateLimitDecision::allow())
    }

    /// Forget the window once the flow it guarded has completed.
    pub async fn reset(&self, email: &str) -> Result<()> {
        self.store.clear(email).await
    }

    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.store.purge_before(now - self.window).await?;
        tracing::debug!("Rate limiter cleanup: {} stale windows removed", removed);
        Ok(removed)
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub struct InMemoryRequestWindows {
    windows: Arc<RwLock<HashMap<String, RequestWindow>>>,
}

#[cfg(test)]
impl InMemoryRequestWindows {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl RequestWindowStore for InMemoryRequestWindows {
    async fn record_request(
        &self,
        email: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RequestWindow> {
        let mut windows = self.windows.write().await;
        let fresh = RequestWindow {
            request_count: 1,
            window_start: now,
        };
        let record = match windows.get_mut(email) {
            Some(current) if now - current.window_start > window => {
                *current = fresh;
                *current
            }
            Some(current) => {
                current.request_count += 1;
                *current
            }
            None => {
                windows.insert(email.to_string(), fresh);
                fresh
            }
        };
        Ok(record)
    }

    async fn clear(&self, email: &str) -> Result<()> {
        self.windows.write().await.remove(email);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, w| w.window_start >= cutoff);
        Ok((before - windows.len()) as u64)
    }
}
