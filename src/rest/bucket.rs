use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::ratelimit::{BucketLimits, RateLimitHeaders};
use super::request::PreparedRequest;
use super::{RestBody, RestInner};
use crate::error::RestError;

/// A request waiting on its bucket, answered exactly once.
pub struct PendingRequest {
    pub request: PreparedRequest,
    pub completion: oneshot::Sender<Result<RestBody, RestError>>,
}

struct BucketState {
    queue: VecDeque<PendingRequest>,
    busy: bool,
    limits: BucketLimits,
}

/// Serializes every request that shares a route.
pub struct RouteBucket {
    key: String,
    state: Mutex<BucketState>,
}

impl RouteBucket {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(BucketState {
                queue: VecDeque::new(),
                busy: false,
                limits: BucketLimits::default(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> BucketLimits {
        self.lock().limits.clone()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// How long the bucket must stay quiet before the next request.
    pub fn wait_time(&self, now: Instant) -> Option<std::time::Duration> {
        self.lock().limits.wait_time(now)
    }

    pub fn update(&self, headers: &RateLimitHeaders) {
        self.lock()
            .limits
            .update(headers, &self.key, Instant::now(), Utc::now());
    }

    /// Queue a request, starting the drain task if the bucket is idle.
    pub(crate) fn push(self: &Arc<Self>, pending: PendingRequest, rest: Arc<RestInner>) {
        let start = {
            let mut state = self.lock();
            state.queue.push_back(pending);
            !std::mem::replace(&mut state.busy, true)
        };
        if start {
            tokio::spawn(self.clone().drain(rest));
        }
    }

    async fn drain(self: Arc<Self>, rest: Arc<RestInner>) {
        let _guard = DrainGuard {
            bucket: self.clone(),
            rest: rest.clone(),
        };
        loop {
            let next = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        state.busy = false;
                        return;
                    }
                }
            };

            if next.completion.is_closed() {
                tracing::debug!(bucket = %self.key, "caller went away, skipping request");
                continue;
            }

            let result = rest.execute(&self, &next.request).await;
            let _ = next.completion.send(result);
        }
    }
}

/// Keeps a bucket usable if its drain task panics: the queue gets a fresh
/// drain task, or the bucket goes idle when nothing is waiting.
struct DrainGuard {
    bucket: Arc<RouteBucket>,
    rest: Arc<RestInner>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        tracing::error!(bucket = %self.bucket.key, "drain task panicked");
        let restart = {
            let mut state = self.bucket.lock();
            state.busy = !state.queue.is_empty();
            state.busy
        };
        if restart {
            tokio::spawn(self.bucket.clone().drain(self.rest.clone()));
        }
    }
}
