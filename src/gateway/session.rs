/// Lifecycle status of a single shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Identifying,
    Resuming,
    AwaitingGuilds,
    Ready,
    Disconnected,
    Reconnecting,
}

/// The resumable identity of a shard's connection.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub shard_id: u32,
    pub session_id: Option<String>,
    pub sequence: i64,
    pub close_sequence: Option<i64>,
    pub status: ConnectionStatus,
}

impl ConnectionSession {
    pub fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            session_id: None,
            sequence: -1,
            close_sequence: None,
            status: ConnectionStatus::Idle,
        }
    }

    /// Record a sequence number; never moves backwards.
    pub fn observe(&mut self, seq: i64) {
        if seq > self.sequence {
            self.sequence = seq;
        }
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Drop the session so the next connection identifies from scratch.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.sequence = -1;
        self.close_sequence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_never_decreases() {
        let mut session = ConnectionSession::new(0);
        session.observe(5);
        session.observe(3);
        assert_eq!(session.sequence, 5);
        session.observe(6);
        assert_eq!(session.sequence, 6);
    }

    #[test]
    fn test_reset_clears_identity() {
        let mut session = ConnectionSession::new(1);
        session.session_id = Some("abc".to_string());
        session.observe(10);
        session.close_sequence = Some(10);
        session.reset();
        assert!(!session.can_resume());
        assert_eq!(session.sequence, -1);
        assert!(session.close_sequence.is_none());
    }
}
