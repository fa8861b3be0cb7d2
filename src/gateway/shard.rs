use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::events::{
    classify_close, close_code, opcode, snowflake, CloseClass, ConnectionProperties,
    GatewayPayload, HelloData, IdentifyData, ResumeData,
};
use super::heartbeat::Heartbeat;
use super::intents::Intents;
use super::session::{ConnectionSession, ConnectionStatus};

/// Everything a shard needs to introduce itself to the gateway.
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    pub token: Option<String>,
    pub shard_count: u32,
    pub intents: Intents,
    pub large_threshold: u32,
    pub properties: ConnectionProperties,
}

/// Lifecycle signals a shard reports to its manager.
#[derive(Debug, Clone)]
pub enum ShardSignalKind {
    /// All expected guilds arrived, or the wait for them timed out.
    Ready { unavailable_guilds: Vec<String> },
    Resumed,
    InvalidSession,
    Closed { code: u16 },
    Dispatch { name: String, data: Value },
    Raw(GatewayPayload),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ShardSignal {
    pub shard_id: u32,
    pub kind: ShardSignalKind,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone)]
pub enum ShardAction {
    Send {
        payload: GatewayPayload,
        priority: bool,
    },
    StartHeartbeat(Duration),
    ArmReadyTimeout(Duration),
    Close {
        code: u16,
    },
    Signal(ShardSignalKind),
}

/// Protocol state of one shard. Holds no socket; the connection driver feeds
/// it decoded payloads and timer ticks and carries out the returned actions.
#[derive(Debug)]
pub struct ShardState {
    session: ConnectionSession,
    identify: IdentifyConfig,
    heartbeat: Heartbeat,
    expected_guilds: HashSet<String>,
    ready_timeout: Duration,
    emit_raw: bool,
    reset_on_close: bool,
}

impl ShardState {
    pub fn new(shard_id: u32, identify: IdentifyConfig, ready_timeout: Duration) -> Self {
        Self {
            session: ConnectionSession::new(shard_id),
            identify,
            heartbeat: Heartbeat::default(),
            expected_guilds: HashSet::new(),
            ready_timeout,
            emit_raw: false,
            reset_on_close: false,
        }
    }

    pub fn with_raw_events(mut self, emit_raw: bool) -> Self {
        self.emit_raw = emit_raw;
        self
    }

    pub fn id(&self) -> u32 {
        self.session.shard_id
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub fn begin_connect(&mut self) {
        self.session.status = match self.session.status {
            ConnectionStatus::Disconnected => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Connecting,
        };
    }

    /// Advance the state machine with one decoded payload.
    pub fn handle(&mut self, payload: GatewayPayload, now: Instant) -> Vec<ShardAction> {
        let mut actions = Vec::new();
        if self.emit_raw {
            actions.push(ShardAction::Signal(ShardSignalKind::Raw(payload.clone())));
        }
        if let Some(seq) = payload.s {
            self.session.observe(seq);
        }

        match payload.op {
            opcode::DISPATCH => self.handle_dispatch(payload, now, &mut actions),
            opcode::HELLO => match serde_json::from_value::<HelloData>(payload.d) {
                Ok(hello) => {
                    let interval = Duration::from_millis(hello.heartbeat_interval);
                    self.heartbeat.start(interval);
                    actions.push(ShardAction::StartHeartbeat(interval));
                    actions.extend(self.identify());
                }
                Err(e) => actions.push(ShardAction::Signal(ShardSignalKind::Error(format!(
                    "malformed HELLO: {e}"
                )))),
            },
            opcode::INVALID_SESSION => {
                if payload.d.as_bool().unwrap_or(false) {
                    actions.extend(self.identify());
                } else {
                    tracing::debug!(shard = self.id(), "session invalidated, not resumable");
                    self.session.reset();
                    self.session.status = ConnectionStatus::Reconnecting;
                    actions.push(ShardAction::Signal(ShardSignalKind::InvalidSession));
                }
            }
            opcode::RECONNECT => {
                tracing::debug!(shard = self.id(), "gateway requested a reconnect");
                actions.push(ShardAction::Close {
                    code: close_code::RECONNECT,
                });
            }
            opcode::HEARTBEAT_ACK => self.heartbeat.acknowledge(now),
            opcode::HEARTBEAT => actions.push(self.heartbeat_frame(now)),
            other => tracing::debug!(shard = self.id(), "ignoring opcode {other}"),
        }

        actions
    }

    fn handle_dispatch(
        &mut self,
        payload: GatewayPayload,
        now: Instant,
        actions: &mut Vec<ShardAction>,
    ) {
        let Some(name) = payload.t else {
            return;
        };
        let data = payload.d;

        match name.as_str() {
            "READY" => {
                self.session.session_id = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.expected_guilds = data
                    .get("guilds")
                    .and_then(Value::as_array)
                    .map(|guilds| {
                        guilds
                            .iter()
                            .filter_map(|g| g.get("id").and_then(snowflake))
                            .collect()
                    })
                    .unwrap_or_default();
                self.session.status = ConnectionStatus::AwaitingGuilds;
                tracing::debug!(
                    shard = self.id(),
                    "ready, awaiting {} guilds",
                    self.expected_guilds.len()
                );
                self.heartbeat.reset_ack();
                actions.push(self.heartbeat_frame(now));
            }
            "RESUMED" => {
                self.session.status = ConnectionStatus::Ready;
                self.heartbeat.reset_ack();
                actions.push(self.heartbeat_frame(now));
                actions.push(ShardAction::Signal(ShardSignalKind::Resumed));
            }
            "GUILD_CREATE" if self.session.status == ConnectionStatus::AwaitingGuilds => {
                if let Some(id) = data.get("id").and_then(snowflake) {
                    self.expected_guilds.remove(&id);
                }
            }
            _ => {}
        }

        let awaiting = self.session.status == ConnectionStatus::AwaitingGuilds
            && (name == "READY" || name == "GUILD_CREATE");
        actions.push(ShardAction::Signal(ShardSignalKind::Dispatch { name, data }));
        if awaiting {
            self.check_ready(actions);
        }
    }

    fn check_ready(&mut self, actions: &mut Vec<ShardAction>) {
        if self.expected_guilds.is_empty() {
            self.session.status = ConnectionStatus::Ready;
            actions.push(ShardAction::Signal(ShardSignalKind::Ready {
                unavailable_guilds: Vec::new(),
            }));
        } else {
            actions.push(ShardAction::ArmReadyTimeout(self.ready_timeout));
        }
    }

    /// Stop waiting for guilds that never arrived.
    pub fn ready_timed_out(&mut self) -> Vec<ShardAction> {
        if self.session.status != ConnectionStatus::AwaitingGuilds {
            return Vec::new();
        }
        let mut unavailable: Vec<String> = self.expected_guilds.drain().collect();
        unavailable.sort();
        tracing::warn!(
            shard = self.id(),
            "ready with {} unavailable guilds",
            unavailable.len()
        );
        self.session.status = ConnectionStatus::Ready;
        vec![ShardAction::Signal(ShardSignalKind::Ready {
            unavailable_guilds: unavailable,
        })]
    }

    /// The heartbeat interval elapsed.
    pub fn heartbeat_due(&mut self, now: Instant) -> Vec<ShardAction> {
        if !self.heartbeat.is_acknowledged() {
            tracing::warn!(shard = self.id(), "heartbeat was not acknowledged, closing");
            self.reset_on_close = true;
            return vec![ShardAction::Close {
                code: close_code::NO_ACK,
            }];
        }
        vec![self.heartbeat_frame(now)]
    }

    fn heartbeat_frame(&mut self, now: Instant) -> ShardAction {
        self.heartbeat.sent(now);
        let seq = if self.session.sequence >= 0 {
            Value::from(self.session.sequence)
        } else {
            Value::Null
        };
        ShardAction::Send {
            payload: GatewayPayload::new(opcode::HEARTBEAT, seq),
            priority: false,
        }
    }

    /// Resume when a session exists, identify otherwise.
    pub fn identify(&mut self) -> Vec<ShardAction> {
        if self.session.can_resume() {
            self.resume()
        } else {
            self.identify_new()
        }
    }

    /// Start a brand new session.
    pub fn identify_new(&mut self) -> Vec<ShardAction> {
        let Some(token) = self.identify.token.clone() else {
            tracing::debug!(shard = self.id(), "no token configured, not identifying");
            return Vec::new();
        };

        self.session.status = ConnectionStatus::Identifying;
        let data = IdentifyData {
            token,
            shard: [self.id(), self.identify.shard_count],
            intents: self.identify.intents.bits(),
            properties: self.identify.properties.clone(),
            large_threshold: self.identify.large_threshold,
            compress: false,
        };
        self.priority_frame(opcode::IDENTIFY, serde_json::to_value(data))
    }

    fn resume(&mut self) -> Vec<ShardAction> {
        let (Some(token), Some(session_id)) =
            (self.identify.token.clone(), self.session.session_id.clone())
        else {
            return self.identify_new();
        };

        self.session.status = ConnectionStatus::Resuming;
        let live = Some(self.session.sequence).filter(|s| *s >= 0);
        let seq = self.session.close_sequence.max(live);
        let data = ResumeData {
            token,
            session_id,
            seq,
        };
        self.priority_frame(opcode::RESUME, serde_json::to_value(data))
    }

    fn priority_frame(
        &self,
        op: u8,
        data: Result<Value, serde_json::Error>,
    ) -> Vec<ShardAction> {
        match data {
            Ok(d) => vec![ShardAction::Send {
                payload: GatewayPayload::new(op, d),
                priority: true,
            }],
            Err(e) => vec![ShardAction::Signal(ShardSignalKind::Error(format!(
                "failed to build opcode {op}: {e}"
            )))],
        }
    }

    /// The socket closed with `code`. Returns how the shard may recover.
    pub fn closed(&mut self, code: u16) -> CloseClass {
        self.heartbeat.stop();
        self.expected_guilds.clear();
        self.session.status = ConnectionStatus::Disconnected;
        if self.session.sequence >= 0 {
            self.session.close_sequence = Some(self.session.sequence);
        }

        let class = classify_close(code);
        if self.reset_on_close || class == CloseClass::NonResumable {
            self.session.reset();
        }
        self.reset_on_close = false;
        class
    }
}
