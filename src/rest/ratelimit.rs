use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use tokio::time::Instant;

/// Extra wait applied to reaction routes, whose reported reset runs early.
pub const REACTION_MARGIN: Duration = Duration::from_millis(250);

/// Longest the server may make us wait for any single limit.
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// Rate limit information carried by one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Reset time as seconds since the epoch.
    pub reset: Option<f64>,
    pub retry_after: Option<Duration>,
    pub global: bool,
    pub date: Option<DateTime<Utc>>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Parse a delay given in (possibly fractional) seconds.
pub fn parse_seconds(raw: &str) -> Option<Duration> {
    seconds(raw.trim().parse().ok()?)
}

/// A server-supplied delay in seconds, capped at `MAX_DELAY`. Negative,
/// NaN and unrepresentable values are unusable.
pub fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .map(|d| d.min(MAX_DELAY))
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            limit: header(headers, "x-ratelimit-limit").and_then(|v| v.parse().ok()),
            remaining: header(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok()),
            reset: header(headers, "x-ratelimit-reset")
                .and_then(|v| v.parse().ok())
                .filter(|v: &f64| v.is_finite()),
            retry_after: header(headers, "retry-after").and_then(parse_seconds),
            global: header(headers, "x-ratelimit-global")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            date: header(headers, "date")
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }

    /// Whether the response described its bucket at all.
    pub fn has_bucket_info(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.reset.is_some()
    }

    /// How long until the bucket resets, measured against the server's clock
    /// so local clock skew does not matter.
    pub fn reset_after(&self, wall_now: DateTime<Utc>) -> Option<Duration> {
        let reset_ms = (self.reset? * 1000.0) as i64;
        let server_now = self.date.unwrap_or(wall_now).timestamp_millis();
        let after = Duration::from_millis(reset_ms.saturating_sub(server_now).max(0) as u64);
        Some(after.min(MAX_DELAY))
    }
}

/// Server-reported state of one route bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketLimits {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
}

impl BucketLimits {
    /// Apply a response's headers. Fields absent from the response keep
    /// their previous values.
    pub fn update(
        &mut self,
        headers: &RateLimitHeaders,
        path: &str,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) {
        if !headers.has_bucket_info() {
            return;
        }
        if let Some(limit) = headers.limit {
            self.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(mut after) = headers.reset_after(wall_now) {
            if path.contains("reactions") {
                after += REACTION_MARGIN;
            }
            self.reset_at = Some(now + after);
        }
    }

    /// Time left before another request may go out, if the bucket is spent.
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at - now),
            _ => None,
        }
    }
}

/// Dispatcher-wide pause triggered by a global rate limit.
///
/// Armed once with a deadline; every request waits on it; the first waiter
/// past the deadline releases it.
#[derive(Debug, Default)]
pub struct GlobalGate {
    until: Mutex<Option<Instant>>,
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate for `duration`. Returns false when it is already closed.
    pub fn arm(&self, duration: Duration) -> bool {
        let now = Instant::now();
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        match *until {
            Some(deadline) if deadline > now => false,
            _ => {
                *until = Some(now + duration.min(MAX_DELAY));
                true
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        let until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        until.is_some_and(|deadline| deadline > Instant::now())
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        loop {
            let deadline = {
                let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
                match *until {
                    Some(deadline) if deadline > Instant::now() => deadline,
                    Some(_) => {
                        *until = None;
                        return;
                    }
                    None => return,
                }
            };
            tokio::time::sleep_until(deadline).await;
        }
    }
}
