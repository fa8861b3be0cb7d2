use std::fmt;

use crate::gateway::events::close_code;

/// Failure decoding or encoding a gateway frame.
#[derive(Debug)]
pub enum CodecError {
    Inflate(flate2::DecompressError),
    Truncated,
    UnsupportedVersion(u8),
    UnknownTag(u8),
    Invalid(String),
    Payload(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Inflate(e) => write!(f, "inflate error: {e}"),
            CodecError::Truncated => write!(f, "term ended unexpectedly"),
            CodecError::UnsupportedVersion(v) => write!(f, "unsupported term format version {v}"),
            CodecError::UnknownTag(tag) => write!(f, "unknown term tag {tag}"),
            CodecError::Invalid(msg) => write!(f, "invalid term: {msg}"),
            CodecError::Payload(e) => write!(f, "malformed gateway payload: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<flate2::DecompressError> for CodecError {
    fn from(e: flate2::DecompressError) -> Self {
        CodecError::Inflate(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Payload(e)
    }
}

/// Structured error returned by the API for a 4xx response.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: u16,
    pub code: u64,
    pub message: String,
    pub errors: Option<serde_json::Value>,
    pub method: String,
    pub path: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed with {} [{}]: {}",
            self.method, self.path, self.status, self.code, self.message
        )
    }
}

#[derive(Debug)]
pub enum RestError {
    /// A request needed authentication but no token is configured.
    TokenMissing,
    /// The HTTP client could not be built.
    Client(reqwest::Error),
    Transport {
        method: String,
        path: String,
        source: reqwest::Error,
    },
    Api(ApiError),
    RetriesExhausted {
        method: String,
        path: String,
        attempts: u32,
    },
    UnexpectedStatus {
        method: String,
        path: String,
        status: u16,
    },
    Decode(String),
    /// The dispatcher dropped the request without answering it.
    Dropped,
}

impl RestError {
    /// HTTP status attached to the failure, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Api(e) => Some(e.status),
            RestError::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestError::TokenMissing => write!(f, "no token is configured"),
            RestError::Client(e) => write!(f, "failed to build HTTP client: {e}"),
            RestError::Transport {
                method,
                path,
                source,
            } => write!(f, "{method} {path} transport error: {source}"),
            RestError::Api(e) => write!(f, "{e}"),
            RestError::RetriesExhausted {
                method,
                path,
                attempts,
            } => write!(f, "{method} {path} gave up after {attempts} attempts"),
            RestError::UnexpectedStatus {
                method,
                path,
                status,
            } => write!(f, "{method} {path} returned unexpected status {status}"),
            RestError::Decode(msg) => write!(f, "failed to decode response: {msg}"),
            RestError::Dropped => write!(f, "request was dropped before completing"),
        }
    }
}

impl std::error::Error for RestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RestError::Transport { source, .. } => Some(source),
            RestError::Client(source) => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum GatewayError {
    TokenMissing,
    /// The credential was rejected during discovery or identify.
    TokenInvalid,
    Rest(RestError),
    /// A shard closed with a code it cannot recover from.
    Closed { shard_id: u32, code: u16 },
    Connect(String),
    Codec(CodecError),
    UnknownShard(u32),
    ShardUnavailable(u32),
    InvalidConfig(String),
    Destroyed,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::TokenMissing => write!(f, "no token is configured"),
            GatewayError::TokenInvalid => write!(f, "the token provided is invalid"),
            GatewayError::Rest(e) => write!(f, "gateway discovery failed: {e}"),
            GatewayError::Closed { shard_id, code } => write!(
                f,
                "shard {shard_id} closed with {code}: {}",
                close_code::describe(*code)
            ),
            GatewayError::Connect(msg) => write!(f, "failed to connect: {msg}"),
            GatewayError::Codec(e) => write!(f, "{e}"),
            GatewayError::UnknownShard(id) => write!(f, "shard {id} is not managed here"),
            GatewayError::ShardUnavailable(id) => write!(f, "shard {id} is not running"),
            GatewayError::InvalidConfig(msg) => write!(f, "invalid gateway config: {msg}"),
            GatewayError::Destroyed => write!(f, "the gateway manager was destroyed"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<RestError> for GatewayError {
    fn from(e: RestError) -> Self {
        match e {
            RestError::TokenMissing => GatewayError::TokenMissing,
            RestError::Api(ref api) if api.status == 401 => GatewayError::TokenInvalid,
            other => GatewayError::Rest(other),
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(e: CodecError) -> Self {
        GatewayError::Codec(e)
    }
}
