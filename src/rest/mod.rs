pub mod bucket;
pub mod endpoints;
pub mod ratelimit;
pub mod request;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ApiError, RestError};
use bucket::{PendingRequest, RouteBucket};
use ratelimit::{GlobalGate, RateLimitHeaders};
use request::{encode_reason, PreparedRequest};

pub use request::RequestOptions;

pub const DEFAULT_API_URL: &str = "https://discord.com/api";
pub const DEFAULT_API_VERSION: u8 = 9;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Used when a 429 carries no usable delay at all.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub api_url: String,
    pub version: u8,
    pub token: Option<String>,
    pub token_type: String,
    pub timeout: Duration,
    /// Extra attempts allowed after a 5xx.
    pub retry_limit: u32,
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            version: DEFAULT_API_VERSION,
            token: None,
            token_type: "Bot".to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            user_agent: format!("DiscordBot (accordclient, {})", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq)]
pub enum RestBody {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

impl RestBody {
    pub fn into_json(self) -> Option<Value> {
        match self {
            RestBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, RestError> {
        match self {
            RestBody::Json(v) => {
                serde_json::from_value(v).map_err(|e| RestError::Decode(e.to_string()))
            }
            RestBody::Bytes(b) => {
                serde_json::from_slice(&b).map_err(|e| RestError::Decode(e.to_string()))
            }
            RestBody::Empty => Err(RestError::Decode("response had no body".to_string())),
        }
    }
}

/// Identify quota reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` refills.
    pub reset_after: u64,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Option<Value>,
    #[serde(default)]
    retry_after: Option<f64>,
}

pub(crate) struct RestInner {
    client: Client,
    config: RestConfig,
    buckets: DashMap<String, Arc<RouteBucket>>,
    global: GlobalGate,
}

/// Sends REST requests while honouring per-route and global rate limits.
#[derive(Clone)]
pub struct RestDispatcher {
    inner: Arc<RestInner>,
}

impl RestDispatcher {
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RestError::Client)?;

        Ok(Self {
            inner: Arc::new(RestInner {
                client,
                config,
                buckets: DashMap::new(),
                global: GlobalGate::new(),
            }),
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    pub fn has_token(&self) -> bool {
        self.inner.config.token.is_some()
    }

    pub fn global_gate(&self) -> &GlobalGate {
        &self.inner.global
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.buckets.len()
    }

    pub fn bucket(&self, path: &str) -> Option<Arc<RouteBucket>> {
        self.inner.buckets.get(path).map(|b| b.clone())
    }

    /// Queue a request on its route bucket and wait for the outcome.
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<RestBody, RestError> {
        let request = PreparedRequest::new(method, path, options);
        if request.auth && !self.has_token() {
            return Err(RestError::TokenMissing);
        }

        let bucket = self
            .inner
            .buckets
            .entry(request.bucket_key().to_string())
            .or_insert_with(|| Arc::new(RouteBucket::new(request.bucket_key())))
            .clone();

        let (tx, rx) = oneshot::channel();
        bucket.push(
            PendingRequest {
                request,
                completion: tx,
            },
            self.inner.clone(),
        );
        rx.await.map_err(|_| RestError::Dropped)?
    }

    pub async fn get(&self, path: &str) -> Result<RestBody, RestError> {
        self.dispatch(Method::GET, path, RequestOptions::default())
            .await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<RestBody, RestError> {
        self.dispatch(Method::POST, path, RequestOptions::new().json(body))
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<RestBody, RestError> {
        self.dispatch(Method::PATCH, path, RequestOptions::new().json(body))
            .await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<RestBody, RestError> {
        let options = match body {
            Some(body) => RequestOptions::new().json(body),
            None => RequestOptions::new(),
        };
        self.dispatch(Method::PUT, path, options).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestBody, RestError> {
        self.dispatch(Method::DELETE, path, RequestOptions::default())
            .await
    }

    /// Socket URL, recommended shard count and identify quota.
    pub async fn gateway_bot(&self) -> Result<GatewayBot, RestError> {
        self.get(&endpoints::gateway_bot()).await?.deserialize()
    }
}

impl RestInner {
    fn base_url(&self) -> String {
        format!(
            "{}/v{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.version
        )
    }

    fn auth_header(&self) -> Result<String, RestError> {
        match &self.config.token {
            Some(token) => Ok(format!("{} {token}", self.config.token_type)),
            None => Err(RestError::TokenMissing),
        }
    }

    async fn send(&self, request: &PreparedRequest) -> Result<Response, RestError> {
        let url = format!("{}{}", self.base_url(), request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(USER_AGENT, &self.config.user_agent);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if request.auth {
            builder = builder.header(AUTHORIZATION, self.auth_header()?);
        }
        if let Some(reason) = &request.reason {
            builder = builder.header("X-Audit-Log-Reason", encode_reason(reason));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|source| RestError::Transport {
            method: request.method.to_string(),
            path: request.path.clone(),
            source,
        })
    }

    /// Run one request to completion, retrying rate limits and server errors.
    pub(crate) async fn execute(
        &self,
        bucket: &RouteBucket,
        request: &PreparedRequest,
    ) -> Result<RestBody, RestError> {
        let mut failures = 0u32;

        loop {
            self.global.wait().await;
            if let Some(wait) = bucket.wait_time(Instant::now()) {
                tracing::debug!(bucket = %bucket.key(), "bucket exhausted, waiting {wait:?}");
                tokio::time::sleep(wait).await;
                continue;
            }

            let response = self.send(request).await?;
            let status = response.status();
            let limits = RateLimitHeaders::from_headers(response.headers());
            bucket.update(&limits);

            if status.is_success() {
                return read_body(request, response).await;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let delay = match limits.retry_after {
                    Some(delay) => delay,
                    None => body_retry_after(response).await,
                };
                if limits.global {
                    if self.global.arm(delay) {
                        tracing::warn!("global rate limit hit, pausing all requests for {delay:?}");
                    }
                } else {
                    tracing::warn!(
                        bucket = %bucket.key(),
                        "rate limited on {} {}, retrying in {delay:?}",
                        request.method,
                        request.path
                    );
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            if status.is_server_error() {
                failures += 1;
                if failures > self.config.retry_limit {
                    return Err(RestError::RetriesExhausted {
                        method: request.method.to_string(),
                        path: request.path.clone(),
                        attempts: failures,
                    });
                }
                tracing::warn!(
                    bucket = %bucket.key(),
                    "{} {} returned {status}, retry {failures}/{}",
                    request.method,
                    request.path,
                    self.config.retry_limit
                );
                continue;
            }

            if status.is_client_error() {
                return Err(RestError::Api(api_error(request, response).await));
            }

            return Err(RestError::UnexpectedStatus {
                method: request.method.to_string(),
                path: request.path.clone(),
                status: status.as_u16(),
            });
        }
    }
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

async fn read_body(request: &PreparedRequest, response: Response) -> Result<RestBody, RestError> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(RestBody::Empty);
    }
    let json = is_json(&response);
    let bytes = response.bytes().await.map_err(|source| RestError::Transport {
        method: request.method.to_string(),
        path: request.path.clone(),
        source,
    })?;

    if bytes.is_empty() {
        Ok(RestBody::Empty)
    } else if json {
        serde_json::from_slice(&bytes)
            .map(RestBody::Json)
            .map_err(|e| RestError::Decode(e.to_string()))
    } else {
        Ok(RestBody::Bytes(bytes.to_vec()))
    }
}

async fn body_retry_after(response: Response) -> Duration {
    let Ok(bytes) = response.bytes().await else {
        return FALLBACK_RETRY_AFTER;
    };
    serde_json::from_slice::<ApiErrorBody>(&bytes)
        .ok()
        .and_then(|body| body.retry_after)
        .and_then(ratelimit::seconds)
        .unwrap_or(FALLBACK_RETRY_AFTER)
}

async fn api_error(request: &PreparedRequest, response: Response) -> ApiError {
    let status = response.status();
    let bytes = response.bytes().await.unwrap_or_default();

    let (code, message, errors) = match serde_json::from_slice::<ApiErrorBody>(&bytes) {
        Ok(body) => (body.code, body.message, body.errors),
        Err(_) => {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            let message = if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            };
            (0, message, None)
        }
    };

    ApiError {
        status: status.as_u16(),
        code,
        message,
        errors,
        method: request.method.to_string(),
        path: request.path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = RestConfig::default();
        assert_eq!(config.api_url, "https://discord.com/api");
        assert_eq!(config.version, 9);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert!(config.user_agent.starts_with("DiscordBot"));
    }

    #[test]
    fn test_body_deserializes() {
        let body = RestBody::Json(json!({
            "url": "wss://gateway.example",
            "shards": 2,
            "session_start_limit": { "total": 1000, "remaining": 999, "reset_after": 5000 }
        }));
        let info: GatewayBot = body.deserialize().unwrap();
        assert_eq!(info.shards, 2);
        assert_eq!(info.session_start_limit.remaining, 999);
        assert_eq!(info.session_start_limit.max_concurrency, 1);
    }

    #[test]
    fn test_empty_body_does_not_deserialize() {
        assert!(matches!(
            RestBody::Empty.deserialize::<Value>(),
            Err(RestError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_queueing() {
        let rest = RestDispatcher::new(RestConfig::default()).unwrap();
        let err = rest.get("/users/@me").await.unwrap_err();
        assert!(matches!(err, RestError::TokenMissing));
        assert_eq!(rest.bucket_count(), 0);
    }

    #[test]
    fn test_auth_header_uses_token_type() {
        let rest = RestDispatcher::new(RestConfig {
            token: Some("abc".to_string()),
            token_type: "Bearer".to_string(),
            ..RestConfig::default()
        })
        .unwrap();
        assert_eq!(rest.inner.auth_header().unwrap(), "Bearer abc");
        assert_eq!(rest.inner.base_url(), "https://discord.com/api/v9");
    }
}
