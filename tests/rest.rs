mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use accordclient::rest::{RequestOptions, RestBody, RestConfig, RestDispatcher};
use accordclient::RestError;
use axum::extract::RawQuery;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Hit {
    at: Instant,
    body: Value,
    headers: HeaderMap,
    query: Option<String>,
}

/// Requests seen by a test server, in arrival order.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<Hit>>>);

impl Log {
    /// Returns how many requests came before this one.
    fn record(&self, body: Value, headers: HeaderMap, query: Option<String>) -> usize {
        let mut hits = self.0.lock().unwrap();
        hits.push(Hit {
            at: Instant::now(),
            body,
            headers,
            query,
        });
        hits.len() - 1
    }

    fn hits(&self) -> Vec<Hit> {
        self.0.lock().unwrap().clone()
    }
}

fn rate_limited(retry_after: &str, global: bool) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            ("retry-after", retry_after.to_string()),
            ("x-ratelimit-global", global.to_string()),
        ],
        Json(json!({
            "message": "You are being rate limited.",
            "retry_after": retry_after.parse::<f64>().unwrap(),
            "global": global
        })),
    )
        .into_response()
}

/// One GET route whose response is chosen by `respond(attempt)`.
async fn scripted(route: &str, log: Log, respond: fn(usize) -> Response) -> RestDispatcher {
    let app = Router::new().route(
        &common::api(route),
        get(move |headers: HeaderMap, RawQuery(query): RawQuery| {
            let log = log.clone();
            async move { respond(log.record(Value::Null, headers, query)) }
        }),
    );
    let addr = common::serve(app).await;
    RestDispatcher::new(common::rest_config(addr)).unwrap()
}

#[tokio::test]
async fn test_same_route_requests_complete_in_order() {
    let log = Log::default();
    let handler_log = log.clone();
    let app = Router::new().route(
        &common::api("/channels/1/messages"),
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let log = handler_log.clone();
            async move {
                match log.record(body.clone(), headers, None) {
                    0 => rate_limited("0.05", false),
                    2 => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    _ => Json(body).into_response(),
                }
            }
        }),
    );
    let addr = common::serve(app).await;
    let rest = RestDispatcher::new(common::rest_config(addr)).unwrap();

    let calls = (0..5).map(|n| {
        let rest = rest.clone();
        async move { rest.post("/channels/1/messages", json!({ "n": n })).await }
    });
    let results = futures_util::future::join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), RestBody::Json(json!({ "n": n })));
    }
    let seen: Vec<Value> = log.hits().into_iter().map(|h| h.body["n"].clone()).collect();
    let expected: Vec<Value> = [0, 0, 1, 1, 2, 3, 4].into_iter().map(|n| json!(n)).collect();
    assert_eq!(seen, expected);
    assert_eq!(rest.bucket_count(), 1);
}

#[tokio::test]
async fn test_rate_limited_request_is_retried_after_delay() {
    let log = Log::default();
    let rest = scripted("/users/@me", log.clone(), |attempt| match attempt {
        0 => rate_limited("0.2", false),
        _ => Json(json!({ "id": "1" })).into_response(),
    })
    .await;

    let body = rest.get("/users/@me").await.unwrap();
    assert_eq!(body, RestBody::Json(json!({ "id": "1" })));

    let hits = log.hits();
    assert_eq!(hits.len(), 2);
    assert!(hits[1].at - hits[0].at >= Duration::from_millis(190));
}

#[tokio::test]
async fn test_unusable_retry_after_does_not_wedge_route() {
    let log = Log::default();
    let rest = scripted("/users/@me", log.clone(), |attempt| match attempt {
        0 => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "1e30")],
            Json(json!({ "message": "You are being rate limited.", "global": false })),
        )
            .into_response(),
        _ => Json(json!({ "id": "1" })).into_response(),
    })
    .await;

    let first = tokio::time::timeout(Duration::from_secs(5), rest.get("/users/@me"))
        .await
        .unwrap();
    assert_eq!(first.unwrap(), RestBody::Json(json!({ "id": "1" })));
    let second = tokio::time::timeout(Duration::from_secs(5), rest.get("/users/@me"))
        .await
        .unwrap();
    assert_eq!(second.unwrap(), RestBody::Json(json!({ "id": "1" })));

    let hits = log.hits();
    assert_eq!(hits.len(), 3);
    assert!(hits[1].at - hits[0].at >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_rate_limits_do_not_use_up_retries() {
    let log = Log::default();
    let rest = scripted("/users/@me", log.clone(), |attempt| match attempt {
        0..=3 => rate_limited("0.01", false),
        _ => StatusCode::NO_CONTENT.into_response(),
    })
    .await;

    assert_eq!(rest.get("/users/@me").await.unwrap(), RestBody::Empty);
    assert_eq!(log.hits().len(), 5);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let log = Log::default();
    let rest = scripted("/guilds/1", log.clone(), |attempt| match attempt {
        0 => StatusCode::BAD_GATEWAY.into_response(),
        _ => Json(json!({ "id": "1", "name": "guild" })).into_response(),
    })
    .await;

    let body = rest.get("/guilds/1").await.unwrap();
    assert_eq!(body.into_json().unwrap()["name"], json!("guild"));
    assert_eq!(log.hits().len(), 2);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let log = Log::default();
    let rest = scripted("/guilds/1", log.clone(), |_| {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
    .await;

    let err = rest.get("/guilds/1").await.unwrap_err();
    match err {
        RestError::RetriesExhausted { attempts, path, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(path, "/guilds/1");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(log.hits().len(), 3);
}

#[tokio::test]
async fn test_client_error_is_structured_and_not_retried() {
    let log = Log::default();
    let rest = scripted("/channels/9", log.clone(), |_| {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "code": 50013, "message": "Missing Permissions" })),
        )
            .into_response()
    })
    .await;

    let err = rest.get("/channels/9").await.unwrap_err();
    assert_eq!(err.status(), Some(403));
    match err {
        RestError::Api(api) => {
            assert_eq!(api.code, 50013);
            assert_eq!(api.message, "Missing Permissions");
            assert_eq!(api.method, "GET");
            assert_eq!(api.path, "/channels/9");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(log.hits().len(), 1);
}

#[tokio::test]
async fn test_exhausted_bucket_waits_for_reset() {
    let log = Log::default();
    let rest = scripted("/channels/1", log.clone(), |_| {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let reset = now.as_secs_f64() + 0.4;
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        (
            StatusCode::OK,
            [
                ("x-ratelimit-limit", "1".to_string()),
                ("x-ratelimit-remaining", "0".to_string()),
                ("x-ratelimit-reset", format!("{reset:.3}")),
                ("date", date),
            ],
            Json(json!({ "id": "1" })),
        )
            .into_response()
    })
    .await;

    let (first, second) = tokio::join!(rest.get("/channels/1"), rest.get("/channels/1"));
    first.unwrap();
    second.unwrap();

    let hits = log.hits();
    assert_eq!(hits.len(), 2);
    assert!(hits[1].at - hits[0].at >= Duration::from_millis(350));
}

#[tokio::test]
async fn test_global_limit_pauses_other_routes() {
    let log = Log::default();
    let a_log = log.clone();
    let b_log = log.clone();
    let app = Router::new()
        .route(
            &common::api("/channels/1"),
            get(move |headers: HeaderMap| {
                let log = a_log.clone();
                async move {
                    match log.record(json!("a"), headers, None) {
                        0 => rate_limited("0.3", true),
                        _ => Json(json!({ "id": "1" })).into_response(),
                    }
                }
            }),
        )
        .route(
            &common::api("/channels/2"),
            get(move |headers: HeaderMap| {
                let log = b_log.clone();
                async move {
                    log.record(json!("b"), headers, None);
                    Json(json!({ "id": "2" })).into_response()
                }
            }),
        );
    let addr = common::serve(app).await;
    let rest = RestDispatcher::new(common::rest_config(addr)).unwrap();

    let first = tokio::spawn({
        let rest = rest.clone();
        async move { rest.get("/channels/1").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rest.global_gate().is_armed());
    rest.get("/channels/2").await.unwrap();
    first.await.unwrap().unwrap();

    let hits = log.hits();
    let limited = hits.iter().find(|h| h.body == json!("a")).unwrap();
    let other = hits.iter().find(|h| h.body == json!("b")).unwrap();
    assert!(other.at - limited.at >= Duration::from_millis(250));
}

#[tokio::test]
async fn test_request_headers_and_query() {
    let log = Log::default();
    let rest = scripted("/guilds/1/members", log.clone(), |_| {
        Json(json!([])).into_response()
    })
    .await;

    let options = RequestOptions::new()
        .query("limit", 2)
        .query("after", Value::Null)
        .query("roles", json!(["1", "2"]))
        .reason("cleanup: old members");
    rest.dispatch(Method::GET, "/guilds/1/members", options)
        .await
        .unwrap();

    let hit = &log.hits()[0];
    assert_eq!(hit.headers["authorization"], "Bot test-token");
    assert!(hit.headers["user-agent"]
        .to_str()
        .unwrap()
        .starts_with("DiscordBot"));
    assert_eq!(hit.headers["x-audit-log-reason"], "cleanup%3A%20old%20members");
    assert_eq!(hit.query.as_deref(), Some("limit=2&roles=1&roles=2"));
    assert!(rest.bucket("/guilds/1/members").is_some());
}

#[tokio::test]
async fn test_unauthenticated_request_skips_header() {
    let log = Log::default();
    let rest = scripted("/gateway", log.clone(), |_| {
        Json(json!({ "url": "wss://gateway.example" })).into_response()
    })
    .await;

    rest.dispatch(Method::GET, "/gateway", RequestOptions::new().auth(false))
        .await
        .unwrap();
    assert!(log.hits()[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_non_json_body_is_returned_as_bytes() {
    let log = Log::default();
    let rest = scripted("/attachments/1", log.clone(), |_| {
        ([("content-type", "image/png")], vec![1u8, 2, 3]).into_response()
    })
    .await;

    assert_eq!(
        rest.get("/attachments/1").await.unwrap(),
        RestBody::Bytes(vec![1, 2, 3])
    );
}

#[tokio::test]
async fn test_transport_errors_fail_without_retry() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let rest = RestDispatcher::new(RestConfig {
        timeout: Duration::from_secs(2),
        ..common::rest_config(addr)
    })
    .unwrap();
    let err = rest.get("/users/@me").await.unwrap_err();
    assert!(matches!(err, RestError::Transport { .. }), "{err:?}");
}
