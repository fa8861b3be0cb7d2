#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use accordclient::gateway::codec::FrameCodec;
use accordclient::gateway::etf;
use accordclient::gateway::events::{opcode, GatewayPayload};
use accordclient::gateway::{GatewayConfig, GatewayEvent};
use accordclient::rest::RestConfig;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::{Compress, Compression, FlushCompress};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const TOKEN: &str = "test-token";

/// Serve `app` on an ephemeral port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Path the dispatcher requests for an API route.
pub fn api(route: &str) -> String {
    format!("/api/v9{route}")
}

pub fn rest_config(addr: SocketAddr) -> RestConfig {
    RestConfig {
        api_url: format!("http://{addr}/api"),
        token: Some(TOKEN.to_string()),
        timeout: Duration::from_secs(5),
        retry_limit: 2,
        ..RestConfig::default()
    }
}

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        spawn_delay: Duration::from_millis(50),
        reconnect_backoff: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(2),
        settle_timeout: Duration::from_secs(10),
        ..GatewayConfig::default()
    }
}

/// How the fake gateway treats its clients.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub shards: u32,
    pub heartbeat_interval: u64,
    /// Close every IDENTIFY with 4004.
    pub reject_token: bool,
    /// Send op 7 once, after the first READY.
    pub reconnect_once: bool,
    /// Status for `GET /gateway/bot`; anything but 200 returns an error body.
    pub discovery_status: u16,
    /// Identifies left in the first discovery answer; later answers report 1000.
    pub identify_remaining: u32,
    /// Milliseconds until the identify quota refills.
    pub quota_reset_after: u64,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            shards: 1,
            heartbeat_interval: 45_000,
            reject_token: false,
            reconnect_once: false,
            discovery_status: 200,
            identify_remaining: 1000,
            quota_reset_after: 0,
        }
    }
}

/// A payload the fake gateway received, tagged with the connection it came in on.
#[derive(Debug, Clone)]
pub struct Received {
    pub at: Instant,
    pub connection: usize,
    pub payload: GatewayPayload,
}

pub struct MockState {
    pub behavior: Behavior,
    pub addr: Mutex<Option<SocketAddr>>,
    pub received: Mutex<Vec<Received>>,
    pub connections: AtomicUsize,
    pub discovery_calls: AtomicUsize,
    reconnect_sent: AtomicBool,
}

impl MockState {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn with_op(&self, op: u8) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.payload.op == op)
            .collect()
    }
}

/// REST discovery and a zlib-stream ETF gateway on one port.
pub struct MockDiscord {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockDiscord {
    pub async fn start(behavior: Behavior) -> Self {
        let state = Arc::new(MockState {
            behavior,
            addr: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            discovery_calls: AtomicUsize::new(0),
            reconnect_sent: AtomicBool::new(false),
        });
        let app = Router::new()
            .route("/", get(gateway_socket))
            .route("/api/v9/gateway/bot", get(gateway_bot))
            .with_state(state.clone());
        let addr = serve(app).await;
        *state.addr.lock().unwrap() = Some(addr);
        Self { addr, state }
    }

    pub fn rest_config(&self) -> RestConfig {
        rest_config(self.addr)
    }
}

async fn gateway_bot(State(state): State<Arc<MockState>>) -> Response {
    let call = state.discovery_calls.fetch_add(1, Ordering::SeqCst);
    let status = StatusCode::from_u16(state.behavior.discovery_status).unwrap();
    if status != StatusCode::OK {
        return (
            status,
            Json(json!({ "code": 0, "message": "401: Unauthorized" })),
        )
            .into_response();
    }
    let addr = state.addr.lock().unwrap().unwrap();
    Json(json!({
        "url": format!("ws://{addr}"),
        "shards": state.behavior.shards,
        "session_start_limit": {
            "total": 1000,
            "remaining": if call == 0 { state.behavior.identify_remaining } else { 1000 },
            "reset_after": state.behavior.quota_reset_after,
            "max_concurrency": 1
        }
    }))
    .into_response()
}

async fn gateway_socket(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

struct Session {
    socket: WebSocket,
    compress: Compress,
    seq: i64,
}

impl Session {
    async fn send(&mut self, payload: GatewayPayload) -> bool {
        let bytes = deflate(&mut self.compress, &FrameCodec::encode(&payload).unwrap());
        self.socket.send(Message::Binary(bytes.into())).await.is_ok()
    }

    async fn dispatch(&mut self, name: &str, data: Value) -> bool {
        self.seq += 1;
        let payload = GatewayPayload::dispatch(name, self.seq, data);
        self.send(payload).await
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code,
            reason: "closed by test".to_string().into(),
        };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}

async fn run_session(socket: WebSocket, state: Arc<MockState>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    let mut session = Session {
        socket,
        compress: Compress::new(Compression::fast(), true),
        seq: 0,
    };

    let hello = GatewayPayload::new(
        opcode::HELLO,
        json!({ "heartbeat_interval": state.behavior.heartbeat_interval }),
    );
    if !session.send(hello).await {
        return;
    }

    while let Some(Ok(msg)) = session.socket.recv().await {
        let bytes = match msg {
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            _ => continue,
        };
        let payload: GatewayPayload = serde_json::from_value(etf::decode(&bytes).unwrap()).unwrap();
        state.received.lock().unwrap().push(Received {
            at: Instant::now(),
            connection,
            payload: payload.clone(),
        });

        match payload.op {
            opcode::IDENTIFY => {
                if state.behavior.reject_token {
                    session.close(4004).await;
                    break;
                }
                let shard = payload.d["shard"][0].as_u64().unwrap_or(0);
                let guild = format!("{}", 100 + shard);
                session
                    .dispatch(
                        "READY",
                        json!({
                            "session_id": format!("session-{shard}"),
                            "user": { "id": "1", "username": "bot" },
                            "guilds": [{ "id": guild, "unavailable": true }]
                        }),
                    )
                    .await;
                session
                    .dispatch("GUILD_CREATE", json!({ "id": guild, "name": "test guild" }))
                    .await;
                if state.behavior.reconnect_once
                    && !state.reconnect_sent.swap(true, Ordering::SeqCst)
                {
                    session
                        .send(GatewayPayload::new(opcode::RECONNECT, Value::Null))
                        .await;
                }
            }
            opcode::RESUME => {
                session.dispatch("RESUMED", Value::Null).await;
            }
            opcode::HEARTBEAT => {
                session
                    .send(GatewayPayload::new(opcode::HEARTBEAT_ACK, Value::Null))
                    .await;
            }
            _ => {}
        }
    }
}

/// Compress with a sync flush so every message ends in the zlib suffix.
pub fn deflate(compress: &mut Compress, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 64);
    let mut consumed = 0;
    loop {
        let before = compress.total_in();
        compress
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .unwrap();
        consumed += (compress.total_in() - before) as usize;
        if consumed >= data.len() && out.len() < out.capacity() {
            break;
        }
        out.reserve(1024);
    }
    out
}

/// Wait for the first event matching `pred`, failing the test after `secs`.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<GatewayEvent>,
    secs: u64,
    pred: F,
) -> GatewayEvent
where
    F: Fn(&GatewayEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until `check` holds, failing the test after `secs`.
pub async fn eventually<F>(secs: u64, check: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}
