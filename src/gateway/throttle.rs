use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Outbound frames allowed per window.
pub const DEFAULT_CAPACITY: u32 = 120;
/// Length of the rolling window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Per-connection outbound rate limiter.
///
/// Remembers when each of the last `capacity` frames left, so no rolling
/// window ever carries more than `capacity` frames regardless of how sends
/// line up with window boundaries.
#[derive(Debug)]
pub struct SendThrottle<T> {
    config: ThrottleConfig,
    sent: VecDeque<Instant>,
    queue: VecDeque<T>,
}

impl<T> SendThrottle<T> {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config: ThrottleConfig {
                capacity: config.capacity.max(1),
                window: config.window,
            },
            sent: VecDeque::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// Queue a frame. Priority frames jump ahead of everything queued.
    pub fn push(&mut self, frame: T, priority: bool) {
        if priority {
            self.queue.push_front(frame);
        } else {
            self.queue.push_back(frame);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames that may still leave in the current window.
    pub fn remaining(&mut self, now: Instant) -> u32 {
        self.expire(now);
        self.config.capacity - self.sent.len() as u32
    }

    /// Take every queued frame that fits in the window, in send order.
    pub fn drain(&mut self, now: Instant) -> Vec<T> {
        self.expire(now);
        let mut ready = Vec::new();
        while (self.sent.len() as u32) < self.config.capacity {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            self.sent.push_back(now);
            ready.push(frame);
        }
        ready
    }

    /// When the next queued frame can leave, if one is waiting on capacity.
    pub fn next_release(&self) -> Option<Instant> {
        if self.queue.is_empty() || (self.sent.len() as u32) < self.config.capacity {
            return None;
        }
        self.sent.front().map(|oldest| *oldest + self.config.window)
    }

    /// Discard everything queued, used when the connection goes away.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.sent.clear();
        dropped
    }
}
