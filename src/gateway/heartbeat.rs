use std::time::Duration;
use tokio::time::Instant;

/// How long a shard waits for missing guilds before reporting ready anyway.
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Liveness bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub interval: Option<Duration>,
    acknowledged: bool,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: None,
            acknowledged: true,
            last_sent: None,
            latency: None,
        }
    }
}

impl Heartbeat {
    pub fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.acknowledged = true;
    }

    pub fn stop(&mut self) {
        self.interval = None;
        self.acknowledged = true;
        self.last_sent = None;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn sent(&mut self, now: Instant) {
        self.acknowledged = false;
        self.last_sent = Some(now);
    }

    /// Forget an outstanding heartbeat, used when the session restarts.
    pub fn reset_ack(&mut self) {
        self.acknowledged = true;
    }

    pub fn acknowledge(&mut self, now: Instant) {
        self.acknowledged = true;
        if let Some(sent) = self.last_sent {
            self.latency = Some(now.saturating_duration_since(sent));
        }
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
