use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::connection::{ShardCommand, ShardHandle, ShardRunner, ShardSnapshot};
use super::dispatcher::{Dispatcher, EventRegistry};
use super::events::{
    classify_close, close_code, is_auth_failure, CloseClass, ConnectionProperties,
    GatewayEvent, GatewayPayload,
};
use super::heartbeat::READY_TIMEOUT;
use super::intents::Intents;
use super::session::ConnectionStatus;
use super::shard::{IdentifyConfig, ShardSignal, ShardSignalKind, ShardState};
use super::throttle::ThrottleConfig;
use crate::error::GatewayError;
use crate::rest::{RestDispatcher, SessionStartLimit};

pub const DEFAULT_GATEWAY_VERSION: u8 = 9;
pub const DEFAULT_LARGE_THRESHOLD: u32 = 250;
pub const DEFAULT_SPAWN_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Which shards this process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardSpec {
    /// As many as discovery recommends.
    Auto,
    List(Vec<u32>),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub shards: ShardSpec,
    /// Total shards across every process; defaults from `shards`.
    pub shard_count: Option<u32>,
    pub intents: Intents,
    pub version: u8,
    pub large_threshold: u32,
    pub emit_raw: bool,
    pub throttle: ThrottleConfig,
    pub ready_timeout: Duration,
    pub spawn_delay: Duration,
    pub reconnect_backoff: Duration,
    /// Longest a spawn may take before the shard is recycled.
    pub settle_timeout: Duration,
    pub event_capacity: usize,
    pub properties: ConnectionProperties,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            shards: ShardSpec::Auto,
            shard_count: None,
            intents: Intents::default(),
            version: DEFAULT_GATEWAY_VERSION,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            emit_raw: false,
            throttle: ThrottleConfig::default(),
            ready_timeout: READY_TIMEOUT,
            spawn_delay: DEFAULT_SPAWN_DELAY,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            properties: ConnectionProperties::default(),
        }
    }
}

/// Work for the spawner, processed strictly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpawnJob {
    Connect(u32),
    /// Re-identify on a live socket after a non-resumable INVALID_SESSION.
    Identify(u32),
    /// The credential was rejected; stop everything.
    Invalidate,
}

/// How a spawn attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ready,
    Resumed,
    InvalidSession,
    Closed(u16),
}

type Waiters = Arc<DashMap<u32, oneshot::Sender<Settlement>>>;

/// Resolve the shard ids to run and the total sent with IDENTIFY.
pub fn plan_shards(
    config: &GatewayConfig,
    recommended: u32,
) -> Result<(Vec<u32>, u32), GatewayError> {
    match &config.shards {
        ShardSpec::Auto => {
            let total = config.shard_count.unwrap_or(recommended).max(1);
            Ok(((0..total).collect(), total))
        }
        ShardSpec::List(ids) => {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            let Some(&highest) = ids.last() else {
                return Err(GatewayError::InvalidConfig("shard list is empty".to_string()));
            };
            let total = config.shard_count.unwrap_or(highest + 1);
            if highest >= total {
                return Err(GatewayError::InvalidConfig(format!(
                    "shard {highest} is outside a total of {total}"
                )));
            }
            Ok((ids, total))
        }
    }
}

/// Socket URL with the version, encoding and compression negotiated.
pub fn gateway_url(base: &str, version: u8) -> String {
    format!(
        "{}/?v={version}&encoding=etf&compress=zlib-stream",
        base.trim_end_matches('/')
    )
}

fn shut_down(flag: &watch::Sender<bool>, shards: &DashMap<u32, ShardHandle>) {
    flag.send_replace(true);
    for shard in shards.iter() {
        shard.command(ShardCommand::Shutdown);
    }
}

/// Owns every shard of this process.
pub struct GatewayManager {
    config: GatewayConfig,
    rest: RestDispatcher,
    events: broadcast::Sender<GatewayEvent>,
    shards: Arc<DashMap<u32, ShardHandle>>,
    shutdown: Arc<watch::Sender<bool>>,
    reconnecting: Arc<AtomicBool>,
    connected: AtomicBool,
    spawner: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayManager {
    pub fn new(config: GatewayConfig, rest: RestDispatcher) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            rest,
            events,
            shards: Arc::new(DashMap::new()),
            shutdown: Arc::new(shutdown),
            reconnecting: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
            spawner: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// True while the spawner is bringing shards back after the first pass.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Discover the gateway, start every shard, and return once the first
    /// spawn pass has settled.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        if self.is_destroyed() {
            return Err(GatewayError::Destroyed);
        }
        if !self.rest.has_token() {
            return Err(GatewayError::TokenMissing);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Connect("already connected".to_string()));
        }

        let registry = EventRegistry::standard()?;
        let discovered = match self.rest.gateway_bot().await {
            Ok(info) => plan_shards(&self.config, info.shards).map(|plan| (info, plan)),
            Err(e) => Err(e.into()),
        };
        let (info, (shard_ids, shard_total)) = match discovered {
            Ok(discovered) => discovered,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let url = gateway_url(&info.url, self.config.version);

        let privileged = self.config.intents.privileged();
        if !privileged.is_empty() {
            tracing::debug!("requesting privileged intents {privileged:?}");
        }
        tracing::info!(
            "spawning {} of {shard_total} shards, {} identifies left",
            shard_ids.len(),
            info.session_start_limit.remaining
        );

        let identify = IdentifyConfig {
            token: self.rest.config().token.clone(),
            shard_count: shard_total,
            intents: self.config.intents,
            large_threshold: self.config.large_threshold,
            properties: self.config.properties.clone(),
        };
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        for &id in &shard_ids {
            let state = ShardState::new(id, identify.clone(), self.config.ready_timeout)
                .with_raw_events(self.config.emit_raw);
            self.shards
                .insert(id, ShardRunner::spawn(state, self.config.throttle, signal_tx.clone()));
        }
        drop(signal_tx);

        let waiters: Waiters = Arc::new(DashMap::new());
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (initial_tx, initial_rx) = oneshot::channel();

        let router = Router {
            dispatcher: Dispatcher::new(registry, self.events.clone(), self.config.emit_raw),
            expected: shard_ids.len(),
            ready: HashSet::new(),
            jobs: job_tx,
            waiters: waiters.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let spawner = Spawner {
            rest: self.rest.clone(),
            url,
            limit: Some(info.session_start_limit),
            queue: shard_ids.iter().map(|&id| SpawnJob::Connect(id)).collect(),
            jobs: job_rx,
            shards: self.shards.clone(),
            waiters,
            spawn_delay: self.config.spawn_delay,
            reconnect_backoff: self.config.reconnect_backoff,
            settle_timeout: self.config.settle_timeout,
            initial: Some(initial_tx),
            events: self.events.clone(),
            shutdown_rx: self.shutdown.subscribe(),
            shutdown: self.shutdown.clone(),
            reconnecting: self.reconnecting.clone(),
        };

        tokio::spawn(router.run(signal_rx));
        *self.spawner.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokio::spawn(spawner.run()));

        match initial_rx.await {
            Ok(Ok(())) => {
                tracing::info!("initial spawn pass complete");
                Ok(())
            }
            Ok(Err(e)) => {
                self.destroy();
                Err(e)
            }
            Err(_) => Err(GatewayError::Destroyed),
        }
    }

    /// Queue an outbound payload on one shard.
    pub fn send(&self, shard_id: u32, payload: GatewayPayload) -> Result<(), GatewayError> {
        let shard = self
            .shards
            .get(&shard_id)
            .ok_or(GatewayError::UnknownShard(shard_id))?;
        if shard.command(ShardCommand::Send(payload)) {
            Ok(())
        } else {
            Err(GatewayError::ShardUnavailable(shard_id))
        }
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shards.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.shards.get(&shard_id).map(|s| s.snapshot())
    }

    /// Last heartbeat round trip of one shard.
    pub fn ping(&self, shard_id: u32) -> Option<Duration> {
        self.status(shard_id).and_then(|s| s.latency)
    }

    /// Mean heartbeat round trip across shards that have measured one.
    pub fn average_ping(&self) -> Option<Duration> {
        let pings: Vec<Duration> = self
            .shards
            .iter()
            .filter_map(|s| s.snapshot().latency)
            .collect();
        if pings.is_empty() {
            return None;
        }
        Some(pings.iter().sum::<Duration>() / pings.len() as u32)
    }

    /// Stop every shard and the spawner. Idempotent.
    pub fn destroy(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("destroying gateway manager");
        shut_down(&self.shutdown, &self.shards);
        // The router exits on its own once every shard task has gone.
        if let Some(spawner) = self.spawner.lock().unwrap_or_else(|e| e.into_inner()).take() {
            spawner.abort();
        }
    }
}

impl Drop for GatewayManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Consumes shard signals: publishes events, tracks readiness, settles spawn
/// waits and queues recovery work.
struct Router {
    dispatcher: Dispatcher,
    expected: usize,
    ready: HashSet<u32>,
    jobs: mpsc::UnboundedSender<SpawnJob>,
    waiters: Waiters,
    shutdown: watch::Receiver<bool>,
}

impl Router {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<ShardSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle(signal);
        }
        tracing::debug!("every shard has stopped, router exiting");
    }

    fn settle(&self, shard_id: u32, settlement: Settlement) {
        if let Some((_, waiter)) = self.waiters.remove(&shard_id) {
            let _ = waiter.send(settlement);
        }
    }

    fn queue(&self, job: SpawnJob) {
        let _ = self.jobs.send(job);
    }

    fn mark_ready(&mut self, shard_id: u32) {
        self.ready.insert(shard_id);
        if self.ready.len() == self.expected && !self.dispatcher.is_ready() {
            tracing::info!("all {} shards are ready", self.expected);
            self.dispatcher.mark_ready();
        }
    }

    fn handle(&mut self, signal: ShardSignal) {
        let shard_id = signal.shard_id;
        match signal.kind {
            ShardSignalKind::Dispatch { name, data } => {
                self.dispatcher.dispatch(shard_id, &name, data);
            }
            ShardSignalKind::Raw(payload) => self.dispatcher.raw(shard_id, &payload),
            ShardSignalKind::Ready { unavailable_guilds } => {
                tracing::info!(shard = shard_id, "shard ready");
                self.dispatcher.publish(GatewayEvent::ShardReady {
                    shard_id,
                    unavailable_guilds,
                });
                self.mark_ready(shard_id);
                self.settle(shard_id, Settlement::Ready);
            }
            ShardSignalKind::Resumed => {
                tracing::info!(shard = shard_id, "shard resumed");
                self.dispatcher
                    .publish(GatewayEvent::ShardResumed { shard_id });
                self.mark_ready(shard_id);
                self.settle(shard_id, Settlement::Resumed);
            }
            ShardSignalKind::InvalidSession => {
                self.ready.remove(&shard_id);
                self.dispatcher
                    .publish(GatewayEvent::InvalidSession { shard_id });
                self.settle(shard_id, Settlement::InvalidSession);
                if !*self.shutdown.borrow() {
                    self.queue(SpawnJob::Identify(shard_id));
                }
            }
            ShardSignalKind::Closed { code } => self.closed(shard_id, code),
            ShardSignalKind::Error(message) => {
                self.dispatcher
                    .publish(GatewayEvent::ShardError { shard_id, message });
            }
        }
    }

    fn closed(&mut self, shard_id: u32, code: u16) {
        self.ready.remove(&shard_id);
        self.dispatcher
            .publish(GatewayEvent::ShardClosed { shard_id, code });
        let spawning = self.waiters.contains_key(&shard_id);
        self.settle(shard_id, Settlement::Closed(code));

        if *self.shutdown.borrow() {
            return;
        }

        match classify_close(code) {
            CloseClass::Unrecoverable => {
                tracing::error!(
                    shard = shard_id,
                    "closed with {code}: {}",
                    close_code::describe(code)
                );
                self.dispatcher
                    .publish(GatewayEvent::ShardDead { shard_id, code });
                if is_auth_failure(code) && !spawning {
                    self.queue(SpawnJob::Invalidate);
                }
            }
            _ => {
                self.dispatcher
                    .publish(GatewayEvent::ShardReconnecting { shard_id });
                self.queue(SpawnJob::Connect(shard_id));
            }
        }
    }
}

enum JobError {
    Shutdown,
    Retry(GatewayError),
    Fatal(GatewayError),
}

/// Brings shards up one at a time and owns the identify quota.
struct Spawner {
    rest: RestDispatcher,
    url: String,
    limit: Option<SessionStartLimit>,
    queue: VecDeque<SpawnJob>,
    jobs: mpsc::UnboundedReceiver<SpawnJob>,
    shards: Arc<DashMap<u32, ShardHandle>>,
    waiters: Waiters,
    spawn_delay: Duration,
    reconnect_backoff: Duration,
    settle_timeout: Duration,
    initial: Option<oneshot::Sender<Result<(), GatewayError>>>,
    events: broadcast::Sender<GatewayEvent>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown: Arc<watch::Sender<bool>>,
    reconnecting: Arc<AtomicBool>,
}

impl Spawner {
    fn enqueue(&mut self, job: SpawnJob) {
        if !self.queue.contains(&job) {
            self.queue.push_back(job);
        }
    }

    fn collect_jobs(&mut self) {
        while let Ok(job) = self.jobs.try_recv() {
            self.enqueue(job);
        }
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown_rx.changed() => false,
        }
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }
            self.collect_jobs();

            let Some(job) = self.queue.pop_front() else {
                if let Some(initial) = self.initial.take() {
                    let _ = initial.send(Ok(()));
                }
                self.reconnecting.store(false, Ordering::SeqCst);
                tokio::select! {
                    job = self.jobs.recv() => match job {
                        Some(job) => self.enqueue(job),
                        None => return,
                    },
                    _ = self.shutdown_rx.changed() => return,
                }
                continue;
            };

            if self.initial.is_none() {
                self.reconnecting.store(true, Ordering::SeqCst);
            }

            match self.run_job(job).await {
                Ok(()) => {}
                Err(JobError::Shutdown) => return,
                Err(JobError::Fatal(e)) => {
                    self.fail(e);
                    return;
                }
                Err(JobError::Retry(e)) => {
                    tracing::warn!(
                        "spawn failed: {e}, retrying in {:?}",
                        self.reconnect_backoff
                    );
                    self.queue.push_front(job);
                    if !self.pause(self.reconnect_backoff).await {
                        return;
                    }
                    continue;
                }
            }

            self.collect_jobs();
            if !self.queue.is_empty() && !self.pause(self.spawn_delay).await {
                return;
            }
        }
    }

    fn fail(&mut self, error: GatewayError) {
        tracing::error!("gateway cannot continue: {error}");
        let invalidated = matches!(error, GatewayError::TokenInvalid);
        match self.initial.take() {
            Some(initial) => {
                let _ = initial.send(Err(error));
            }
            None => {
                if invalidated && self.events.receiver_count() > 0 {
                    let _ = self.events.send(GatewayEvent::Invalidated);
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        shut_down(&self.shutdown, &self.shards);
    }

    async fn discover(&mut self) -> Result<SessionStartLimit, JobError> {
        let rest = self.rest.clone();
        let info = tokio::select! {
            info = rest.gateway_bot() => info,
            _ = self.shutdown_rx.changed() => return Err(JobError::Shutdown),
        };
        match info {
            Ok(info) => Ok(info.session_start_limit),
            Err(e) => match GatewayError::from(e) {
                e @ (GatewayError::TokenInvalid | GatewayError::TokenMissing) => {
                    Err(JobError::Fatal(e))
                }
                e => Err(JobError::Retry(e)),
            },
        }
    }

    /// Take one identify from the quota, waiting for it to refill if needed.
    async fn acquire_identify(&mut self) -> Result<(), JobError> {
        loop {
            let limit = match self.limit {
                Some(limit) => limit,
                None => self.discover().await?,
            };
            if limit.remaining > 0 {
                self.limit = Some(SessionStartLimit {
                    remaining: limit.remaining - 1,
                    ..limit
                });
                return Ok(());
            }

            let wait = Duration::from_millis(limit.reset_after);
            tracing::warn!("identify quota exhausted, waiting {wait:?}");
            self.limit = None;
            if !self.pause(wait).await {
                return Err(JobError::Shutdown);
            }
        }
    }

    async fn run_job(&mut self, job: SpawnJob) -> Result<(), JobError> {
        let (shard_id, identify_only) = match job {
            SpawnJob::Connect(id) => (id, false),
            SpawnJob::Identify(id) => (id, true),
            SpawnJob::Invalidate => return Err(JobError::Fatal(GatewayError::TokenInvalid)),
        };
        let Some(handle) = self.shards.get(&shard_id).map(|h| h.clone()) else {
            return Ok(());
        };

        let snapshot = handle.snapshot();
        if identify_only && snapshot.status != ConnectionStatus::Reconnecting {
            tracing::debug!(shard = shard_id, "no longer waiting to identify");
            return Ok(());
        }
        if !identify_only
            && !matches!(
                snapshot.status,
                ConnectionStatus::Idle | ConnectionStatus::Disconnected
            )
        {
            tracing::debug!(shard = shard_id, "already connecting");
            return Ok(());
        }

        if identify_only || snapshot.session_id.is_none() {
            self.acquire_identify().await?;
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(shard_id, tx);
        let sent = if identify_only {
            handle.snapshot().status == ConnectionStatus::Reconnecting
                && handle.command(ShardCommand::Identify)
        } else {
            handle.command(ShardCommand::Connect {
                url: self.url.clone(),
            })
        };
        if !sent {
            self.waiters.remove(&shard_id);
            return Ok(());
        }

        let settlement = tokio::select! {
            settlement = rx => settlement.ok(),
            _ = tokio::time::sleep(self.settle_timeout) => {
                tracing::warn!(
                    shard = shard_id,
                    "shard did not settle in {:?}, recycling",
                    self.settle_timeout
                );
                self.waiters.remove(&shard_id);
                handle.command(ShardCommand::Close { code: close_code::RECONNECT });
                None
            }
            _ = self.shutdown_rx.changed() => return Err(JobError::Shutdown),
        };

        match settlement {
            Some(Settlement::Closed(code)) if is_auth_failure(code) => {
                Err(JobError::Fatal(GatewayError::TokenInvalid))
            }
            Some(Settlement::Closed(code))
                if classify_close(code) == CloseClass::Unrecoverable && self.initial.is_some() =>
            {
                Err(JobError::Fatal(GatewayError::Closed { shard_id, code }))
            }
            Some(settled) => {
                tracing::debug!(shard = shard_id, "spawn settled: {settled:?}");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
