use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use serde_json::Value;

/// Characters left alone by `encodeURIComponent`-style escaping.
const REASON_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Per-request knobs accepted by the dispatcher.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub body: Option<Value>,
    pub query: Vec<(String, Value)>,
    pub auth: bool,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: None,
            query: Vec::new(),
            auth: true,
            reason: None,
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn auth(mut self, auth: bool) -> Self {
        self.auth = auth;
        self
    }

    /// Audit log reason attached to moderation actions.
    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

fn is_null_like(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == "null" || s == "undefined",
        _ => false,
    }
}

fn query_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten query options into pairs: null-like values are dropped and arrays
/// repeat their key once per element.
pub fn query_pairs(query: &[(String, Value)]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in query {
        match value {
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|v| !is_null_like(v))
                    .map(|v| (key.clone(), query_string(v))),
            ),
            v if is_null_like(v) => {}
            v => pairs.push((key.clone(), query_string(v))),
        }
    }
    pairs
}

pub fn encode_reason(reason: &str) -> String {
    utf8_percent_encode(reason, REASON_ENCODE_SET).to_string()
}

/// A request ready to be queued on its bucket.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    /// Route path without the query string; also the bucket key.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: bool,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl PreparedRequest {
    pub fn new(method: Method, path: &str, options: RequestOptions) -> Self {
        let (path, mut query) = match path.split_once('?') {
            Some((path, inline)) => (
                path.to_string(),
                inline
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| {
                        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                        (k.to_string(), v.to_string())
                    })
                    .collect(),
            ),
            None => (path.to_string(), Vec::new()),
        };
        query.extend(query_pairs(&options.query));

        Self {
            method,
            path,
            query,
            body: options.body,
            auth: options.auth,
            reason: options.reason,
            headers: options.headers,
        }
    }

    pub fn bucket_key(&self) -> &str {
        &self.path
    }
}
