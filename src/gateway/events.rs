use serde::{Deserialize, Serialize};

use super::dispatcher::EventKind;

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const STATUS_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const VOICE_GUILD_PING: u8 = 5;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    /// Reported when the socket ends without a close frame.
    pub const ABNORMAL: u16 = 1006;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SESSION: u16 = 4006;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_VERSION: u16 = 4012;
    pub const INVALID_INTENT: u16 = 4013;
    pub const DISALLOWED_INTENT: u16 = 4014;

    /// Code used when the gateway asks us to reconnect.
    pub const RECONNECT: u16 = UNKNOWN_ERROR;
    /// Code used when a heartbeat went unacknowledged.
    pub const NO_ACK: u16 = SESSION_TIMED_OUT;

    pub const UNRECOVERABLE: &[u16] = &[
        AUTH_FAILED,
        INVALID_SHARD,
        SHARDING_REQUIRED,
        INVALID_INTENT,
        DISALLOWED_INTENT,
    ];

    pub const NON_RESUMABLE: &[u16] = &[NORMAL, INVALID_SESSION, INVALID_SEQ];

    /// Human readable description of a close code.
    pub fn describe(code: u16) -> &'static str {
        match code {
            NORMAL => "The connection was closed normally.",
            ABNORMAL => "The connection dropped without a close frame.",
            UNKNOWN_ERROR => "An unknown websocket error has occurred.",
            UNKNOWN_OPCODE => "An unknown opcode was sent.",
            DECODE_ERROR => "The gateway could not decode our payload.",
            NOT_AUTHENTICATED => "A payload was sent before identifying.",
            AUTH_FAILED => "The token provided is invalid.",
            ALREADY_AUTHENTICATED => "The client is already authenticated.",
            INVALID_SESSION => "The session is no longer valid.",
            INVALID_SEQ => "The sequence sent when resuming was invalid.",
            RATE_LIMITED => "Too many payloads were sent.",
            SESSION_TIMED_OUT => "The session timed out.",
            INVALID_SHARD => "The shard sent was invalid.",
            SHARDING_REQUIRED => {
                "The session would have handled too many guilds; sharding is required."
            }
            INVALID_VERSION => "An invalid gateway version was requested.",
            INVALID_INTENT => "An invalid intent value was provided.",
            DISALLOWED_INTENT => "A privileged intent that is not enabled was requested.",
            _ => "Unknown close code.",
        }
    }
}

/// How a closed connection may be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// The shard must not reconnect at all.
    Unrecoverable,
    /// The session is gone; reconnect with a fresh identify.
    NonResumable,
    /// Reconnect and resume the previous session.
    Resumable,
}

pub fn classify_close(code: u16) -> CloseClass {
    if close_code::UNRECOVERABLE.contains(&code) {
        CloseClass::Unrecoverable
    } else if close_code::NON_RESUMABLE.contains(&code) {
        CloseClass::NonResumable
    } else {
        CloseClass::Resumable
    }
}

/// Whether a close code means the credential was rejected.
pub fn is_auth_failure(code: u16) -> bool {
    code == close_code::AUTH_FAILED
}

/// Gateway message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: serde_json::Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    pub fn dispatch(name: &str, seq: i64, d: serde_json::Value) -> Self {
        Self {
            op: opcode::DISPATCH,
            d,
            s: Some(seq),
            t: Some(name.to_string()),
        }
    }
}

/// HELLO payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

/// Properties sent along with IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "accordclient".to_string(),
            device: "accordclient".to_string(),
        }
    }
}

/// IDENTIFY payload data.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub shard: [u32; 2],
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub large_threshold: u32,
    pub compress: bool,
}

/// RESUME payload data.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: Option<i64>,
}

/// A dispatch event routed to consumers.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub name: String,
    pub data: serde_json::Value,
    pub shard_id: u32,
}

/// Events published by the gateway to its consumers.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Every shard is fully ready.
    Ready,
    /// A shard received all of its guilds, or gave up waiting for some.
    ShardReady {
        shard_id: u32,
        unavailable_guilds: Vec<String>,
    },
    ShardResumed {
        shard_id: u32,
    },
    ShardClosed {
        shard_id: u32,
        code: u16,
    },
    ShardReconnecting {
        shard_id: u32,
    },
    /// A shard closed with a code it cannot recover from.
    ShardDead {
        shard_id: u32,
        code: u16,
    },
    InvalidSession {
        shard_id: u32,
    },
    ShardError {
        shard_id: u32,
        message: String,
    },
    /// The credential was rejected while reconnecting; the gateway shut down.
    Invalidated,
    Dispatch(DispatchEvent),
    Raw {
        shard_id: u32,
        payload: GatewayPayload,
    },
}

/// Read a snowflake that may arrive as an integer or a string.
pub fn snowflake(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
