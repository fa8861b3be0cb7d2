use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::codec::FrameCodec;
use super::events::{close_code, GatewayPayload};
use super::session::ConnectionStatus;
use super::shard::{ShardAction, ShardSignal, ShardSignalKind, ShardState};
use super::throttle::{SendThrottle, ThrottleConfig};

/// How long opening the socket may take before it counts as a failed attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Instructions from the manager to a shard task.
#[derive(Debug)]
pub enum ShardCommand {
    Connect { url: String },
    /// Start a fresh session on the live socket.
    Identify,
    Send(GatewayPayload),
    Close { code: u16 },
    Shutdown,
}

/// Point-in-time view of a shard, published by its task.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSnapshot {
    pub status: ConnectionStatus,
    pub latency: Option<Duration>,
    pub session_id: Option<String>,
    pub sequence: i64,
}

impl ShardSnapshot {
    fn of(state: &ShardState) -> Self {
        Self {
            status: state.status(),
            latency: state.latency(),
            session_id: state.session().session_id.clone(),
            sequence: state.session().sequence,
        }
    }
}

/// Manager-side handle to a running shard task.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    pub id: u32,
    commands: mpsc::UnboundedSender<ShardCommand>,
    snapshot: watch::Receiver<ShardSnapshot>,
}

impl ShardHandle {
    /// Returns false once the shard task has exited.
    pub fn command(&self, command: ShardCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        self.snapshot.borrow().clone()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

/// Owns one shard's protocol state and drives its socket, one connection
/// attempt at a time.
pub struct ShardRunner {
    state: ShardState,
    throttle: ThrottleConfig,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    signals: mpsc::UnboundedSender<ShardSignal>,
    snapshot: watch::Sender<ShardSnapshot>,
}

impl ShardRunner {
    pub fn spawn(
        state: ShardState,
        throttle: ThrottleConfig,
        signals: mpsc::UnboundedSender<ShardSignal>,
    ) -> ShardHandle {
        let id = state.id();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ShardSnapshot::of(&state));

        let runner = ShardRunner {
            state,
            throttle,
            commands: commands_rx,
            signals,
            snapshot: snapshot_tx,
        };
        tokio::spawn(runner.run());

        ShardHandle {
            id,
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    fn id(&self) -> u32 {
        self.state.id()
    }

    fn signal(&self, kind: ShardSignalKind) {
        let _ = self.signals.send(ShardSignal {
            shard_id: self.id(),
            kind,
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(ShardSnapshot::of(&self.state));
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                ShardCommand::Connect { url } => {
                    if let Flow::Shutdown = self.connect(&url).await {
                        break;
                    }
                }
                ShardCommand::Shutdown => break,
                ShardCommand::Send(payload) => tracing::warn!(
                    shard = self.id(),
                    "shard is not connected, dropping op {}",
                    payload.op
                ),
                ShardCommand::Identify | ShardCommand::Close { .. } => {
                    tracing::debug!(shard = self.id(), "not connected, ignoring {command:?}")
                }
            }
        }
        tracing::debug!(shard = self.id(), "shard task exiting");
    }

    async fn connect(&mut self, url: &str) -> Flow {
        self.state.begin_connect();
        self.publish();
        tracing::info!(shard = self.id(), "connecting to {url}");

        let connecting = tokio_tungstenite::connect_async(url);
        let socket = match tokio::time::timeout(CONNECT_TIMEOUT, connecting).await {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => {
                tracing::warn!(shard = self.id(), "failed to open gateway socket: {e}");
                self.signal(ShardSignalKind::Error(e.to_string()));
                return self.finish(close_code::ABNORMAL);
            }
            Err(_) => {
                tracing::warn!(shard = self.id(), "timed out opening gateway socket");
                return self.finish(close_code::ABNORMAL);
            }
        };

        let (mut sink, mut stream) = socket.split();
        let mut codec = FrameCodec::new();
        let mut throttle: SendThrottle<GatewayPayload> = SendThrottle::new(self.throttle);
        let mut heartbeat: Option<Interval> = None;
        let mut ready_deadline: Option<Instant> = None;

        let (code, flow, send_close) = loop {
            let mut send_failed = false;
            for payload in throttle.drain(Instant::now()) {
                let bytes = match FrameCodec::encode(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let reason = format!("failed to encode op {}: {e}", payload.op);
                        self.signal(ShardSignalKind::Error(reason));
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    tracing::warn!(shard = self.id(), "failed to send frame: {e}");
                    send_failed = true;
                    break;
                }
            }
            if send_failed {
                break (close_code::ABNORMAL, Flow::Continue, false);
            }
            let release = throttle.next_release();

            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => match codec.push(&bytes) {
                        Ok(Some(payload)) => {
                            let actions = self.state.handle(payload, Instant::now());
                            let closed = self.apply(
                                actions,
                                &mut throttle,
                                &mut heartbeat,
                                &mut ready_deadline,
                            );
                            if let Some(code) = closed {
                                break (code, Flow::Continue, true);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(shard = self.id(), "dropping undecodable message: {e}");
                            self.signal(ShardSignalKind::Error(e.to_string()));
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(close_code::ABNORMAL);
                        break (code, Flow::Continue, false);
                    }
                    Some(Ok(Message::Text(_))) => {
                        tracing::debug!(shard = self.id(), "ignoring text frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(shard = self.id(), "gateway socket error: {e}");
                        break (close_code::ABNORMAL, Flow::Continue, false);
                    }
                    None => break (close_code::ABNORMAL, Flow::Continue, false),
                },
                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let actions = self.state.heartbeat_due(Instant::now());
                    let closed = self.apply(
                        actions,
                        &mut throttle,
                        &mut heartbeat,
                        &mut ready_deadline,
                    );
                    if let Some(code) = closed {
                        break (code, Flow::Continue, true);
                    }
                }
                _ = async {
                    match ready_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    ready_deadline = None;
                    let actions = self.state.ready_timed_out();
                    self.apply(actions, &mut throttle, &mut heartbeat, &mut ready_deadline);
                }
                _ = async {
                    match release {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                command = self.commands.recv() => match command {
                    Some(ShardCommand::Send(payload)) => throttle.push(payload, false),
                    Some(ShardCommand::Identify) => {
                        let actions = self.state.identify_new();
                        self.apply(actions, &mut throttle, &mut heartbeat, &mut ready_deadline);
                    }
                    Some(ShardCommand::Close { code }) => break (code, Flow::Continue, true),
                    Some(ShardCommand::Shutdown) | None => {
                        break (close_code::NORMAL, Flow::Shutdown, true)
                    }
                    Some(ShardCommand::Connect { .. }) => {
                        tracing::debug!(shard = self.id(), "already connected");
                    }
                },
            }
        };

        if send_close {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: String::new().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }

        let dropped = throttle.clear();
        if dropped > 0 {
            tracing::debug!(shard = self.id(), "discarded {dropped} queued frames");
        }

        match flow {
            Flow::Shutdown => {
                self.state.closed(code);
                self.publish();
                self.signal(ShardSignalKind::Closed { code });
                Flow::Shutdown
            }
            Flow::Continue => self.finish(code),
        }
    }

    /// Record the close, drop anything queued for the dead socket, and tell
    /// the manager.
    fn finish(&mut self, code: u16) -> Flow {
        let class = self.state.closed(code);
        tracing::info!(shard = self.id(), "connection closed with {code} ({class:?})");

        let mut flow = Flow::Continue;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ShardCommand::Shutdown => flow = Flow::Shutdown,
                ShardCommand::Send(payload) => tracing::warn!(
                    shard = self.id(),
                    "connection closed, dropping op {}",
                    payload.op
                ),
                _ => {}
            }
        }

        self.publish();
        self.signal(ShardSignalKind::Closed { code });
        flow
    }

    /// Carry out the state machine's requests. Returns a close code if the
    /// connection should end.
    fn apply(
        &mut self,
        actions: Vec<ShardAction>,
        throttle: &mut SendThrottle<GatewayPayload>,
        heartbeat: &mut Option<Interval>,
        ready_deadline: &mut Option<Instant>,
    ) -> Option<u16> {
        let mut close = None;
        for action in actions {
            match action {
                ShardAction::Send { payload, priority } => throttle.push(payload, priority),
                ShardAction::StartHeartbeat(period) => {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    *heartbeat = Some(interval);
                }
                ShardAction::ArmReadyTimeout(after) => {
                    *ready_deadline = Some(Instant::now() + after);
                }
                ShardAction::Close { code } => close = Some(code),
                ShardAction::Signal(kind) => self.signal(kind),
            }
        }
        self.publish();
        close
    }
}
