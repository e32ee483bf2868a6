//! One physical connection and its dispatch task
//!
//! The task owns the socket and the [`TopicStore`]; frames are decoded and
//! applied one at a time, so operations for a topic are applied in arrival
//! order. Consumers interact through the shared subscription table and the
//! outbound queue.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::client::{Inbound, WebSocketClient};
use crate::adapter::Adapter;
use crate::config::VenueConfig;
use crate::error::{DesyncReason, Result, SyncError};
use crate::message::{Decoded, Operation, VenueError};
use crate::metrics::SyncMetrics;
use crate::orderbook::BookSnapshot;
use crate::router::{Router, TopicState, TopicUpdate, TopicValue, WaitMode, Watcher};
use crate::snapshot::SnapshotLoader;
use crate::store::{is_symbol_scoped, Resolution, TopicStore};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug)]
struct SubscriptionEntry {
    request: Option<String>,
    refs: usize,
    /// Subscription order, used when replaying
    seq: u64,
}

#[derive(Debug)]
struct Authentication {
    request: String,
    ack_topic: String,
}

#[derive(Debug)]
struct Shared {
    status: ConnectionStatus,
    /// Incremented for every socket; frames queued for an older socket are dropped
    epoch: u64,
    subscriptions: HashMap<String, SubscriptionEntry>,
    next_seq: u64,
    auth: Option<Authentication>,
}

type Outbound = (u64, String);

enum Command {
    Discard(String),
    Snapshot {
        topic: String,
        result: Result<BookSnapshot>,
        attempt: u32,
    },
    Shutdown,
}

enum SessionEnd {
    Lost(SyncError),
    Shutdown,
}

/// A live connection to one endpoint
pub struct Connection {
    url: String,
    venue: Arc<VenueConfig>,
    adapter: Arc<dyn Adapter>,
    metrics: SyncMetrics,
    router: Router,
    shared: Mutex<Shared>,
    outbound: mpsc::Sender<Outbound>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Connect and start the dispatch task
    pub(crate) async fn open(
        url: &str,
        venue: Arc<VenueConfig>,
        adapter: Arc<dyn Adapter>,
        metrics: SyncMetrics,
    ) -> Result<Arc<Self>> {
        let client = WebSocketClient::connect(url).await?;
        let (connection, worker) = Self::new(url, venue, adapter, metrics)?;
        tokio::spawn(worker.run(client));
        Ok(connection)
    }

    fn new(
        url: &str,
        venue: Arc<VenueConfig>,
        adapter: Arc<dyn Adapter>,
        metrics: SyncMetrics,
    ) -> Result<(Arc<Self>, Worker)> {
        let (outbound_tx, outbound_rx) = mpsc::channel(venue.outbound_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            url: url.to_string(),
            venue: venue.clone(),
            adapter,
            metrics,
            router: Router::with_merge_limit(
                venue.trades_limit.max(venue.ohlcv_limit).max(venue.orders_limit),
            ),
            shared: Mutex::new(Shared {
                status: ConnectionStatus::Open,
                epoch: 0,
                subscriptions: HashMap::new(),
                next_seq: 0,
                auth: None,
            }),
            outbound: outbound_tx,
            commands: commands_tx,
        });

        let worker = Worker {
            connection: connection.clone(),
            store: TopicStore::new(venue),
            snapshots: SnapshotLoader::new()?,
            fetching: HashSet::new(),
            outbound: outbound_rx,
            commands: commands_rx,
        };

        Ok((connection, worker))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Subscribed topics in subscription order
    pub fn topics(&self) -> Vec<String> {
        let shared = self.lock();
        let mut topics: Vec<(&String, u64)> = shared
            .subscriptions
            .iter()
            .map(|(topic, entry)| (topic, entry.seq))
            .collect();
        topics.sort_by_key(|(_, seq)| *seq);
        topics.into_iter().map(|(topic, _)| topic.clone()).collect()
    }

    /// Consumers holding a reference to the topic
    pub fn ref_count(&self, topic: &str) -> usize {
        self.lock()
            .subscriptions
            .get(topic)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    /// Register a waiter on `topics` and send `request` if any topic is new
    pub async fn watch(
        self: &Arc<Self>,
        topics: Vec<String>,
        request: Option<String>,
        mode: WaitMode,
    ) -> Result<Subscription> {
        if topics.is_empty() {
            return Err(SyncError::Config("no topics to watch".to_string()));
        }
        if self.status() == ConnectionStatus::Closed {
            return Err(SyncError::Transport(format!(
                "connection to {} is closed",
                self.url
            )));
        }

        let watcher = self.router.register(&topics, mode);
        let pending = self.retain(&topics, request);
        let subscription = Subscription {
            watcher,
            topics,
            connection: Arc::downgrade(self),
        };

        if let Some((epoch, frame)) = pending {
            self.enqueue(epoch, frame).await?;
        }
        Ok(subscription)
    }

    /// Write one frame; fails unless the socket is open
    pub async fn send(&self, frame: String) -> Result<()> {
        let epoch = {
            let shared = self.lock();
            if shared.status != ConnectionStatus::Open {
                return Err(SyncError::Transport(format!(
                    "connection to {} is not open",
                    self.url
                )));
            }
            shared.epoch
        };
        self.enqueue(epoch, frame).await
    }

    /// Send an authentication frame and wait for the venue's acknowledgement
    ///
    /// The frame is re-sent first after every reconnect.
    pub async fn authenticate(&self, request: String, ack_topic: &str) -> Result<TopicUpdate> {
        let mut watcher = self
            .router
            .register(&[ack_topic.to_string()], WaitMode::Once);

        let pending = {
            let mut shared = self.lock();
            if shared.status == ConnectionStatus::Closed {
                return Err(SyncError::Transport(format!(
                    "connection to {} is closed",
                    self.url
                )));
            }
            shared.auth = Some(Authentication {
                request: request.clone(),
                ack_topic: ack_topic.to_string(),
            });
            (shared.status == ConnectionStatus::Open).then_some(shared.epoch)
        };

        if let Some(epoch) = pending {
            self.enqueue(epoch, request).await?;
        }
        watcher.recv().await
    }

    /// Unsubscribe a topic regardless of its reference count
    pub fn unwatch(&self, topic: &str) -> bool {
        self.release(&[topic.to_string()], true) > 0
    }

    /// Stop the dispatch task and close the socket
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.lock().status = status;
    }

    async fn enqueue(&self, epoch: u64, frame: String) -> Result<()> {
        self.outbound.send((epoch, frame)).await.map_err(|_| {
            SyncError::Transport(format!("connection task for {} stopped", self.url))
        })
    }

    /// Queue a frame without waiting for room in the outbound queue
    fn offer(&self, epoch: u64, frame: String) -> Result<()> {
        self.outbound.try_send((epoch, frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::Capacity(format!("outbound queue for {} is full", self.url))
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::Transport(format!("connection task for {} stopped", self.url))
            }
        })
    }

    /// Take a reference on each topic; returns the frame to send now, if any
    fn retain(&self, topics: &[String], request: Option<String>) -> Option<Outbound> {
        let mut shared = self.lock();
        let mut send = false;

        for topic in topics {
            let desynced = self.router.state(topic) == TopicState::Desynced;
            let fresh = !shared.subscriptions.contains_key(topic) || desynced;

            if !shared.subscriptions.contains_key(topic) {
                let seq = shared.next_seq;
                shared.next_seq += 1;
                shared.subscriptions.insert(
                    topic.clone(),
                    SubscriptionEntry {
                        request: request.clone(),
                        refs: 0,
                        seq,
                    },
                );
            }
            if let Some(entry) = shared.subscriptions.get_mut(topic) {
                entry.refs += 1;
                if desynced && request.is_some() {
                    entry.request = request.clone();
                }
            }

            if fresh {
                self.router.set_state(topic, TopicState::Subscribing);
                send = true;
            }
        }

        self.metrics
            .topics
            .with_label_values(&[&self.url])
            .set(shared.subscriptions.len() as i64);

        match request {
            Some(frame) if send && shared.status == ConnectionStatus::Open => {
                Some((shared.epoch, frame))
            }
            _ => None,
        }
    }

    /// Drop references; topics reaching zero are unsubscribed and their waiters cancelled
    fn release(&self, topics: &[String], force: bool) -> usize {
        let (closed, epoch) = {
            let mut shared = self.lock();
            let mut closed = Vec::new();
            for topic in topics {
                let Some(entry) = shared.subscriptions.get_mut(topic) else {
                    continue;
                };
                entry.refs = if force { 0 } else { entry.refs.saturating_sub(1) };
                if entry.refs == 0 {
                    shared.subscriptions.remove(topic);
                    closed.push(topic.clone());
                }
            }
            self.metrics
                .topics
                .with_label_values(&[&self.url])
                .set(shared.subscriptions.len() as i64);
            let epoch = (shared.status == ConnectionStatus::Open).then_some(shared.epoch);
            (closed, epoch)
        };

        for topic in &closed {
            if let (Some(epoch), Some(frame)) = (epoch, self.adapter.unsubscribe_request(topic)) {
                if let Err(e) = self.offer(epoch, frame) {
                    warn!(url = %self.url, topic = %topic, error = %e, "Unsubscribe frame dropped");
                }
            }
            self.router.close(topic);
            let _ = self.commands.send(Command::Discard(topic.clone()));
            debug!(url = %self.url, topic = %topic, "Topic unsubscribed");
        }

        closed.len()
    }

    /// Topic is subscribed and not waiting for a resubscribe
    ///
    /// An account-wide stream such as `orders` is also accepted while only
    /// symbol keys derived from it (`orders:BTC/USD`) are subscribed.
    fn accepts(&self, topic: &str) -> bool {
        if self.router.state(topic) == TopicState::Desynced {
            return false;
        }
        let shared = self.lock();
        if shared.subscriptions.contains_key(topic) {
            return true;
        }
        if is_symbol_scoped(topic) {
            return false;
        }
        let prefix = format!("{}:", topic);
        shared.subscriptions.keys().any(|key| key.starts_with(&prefix))
    }

    fn subscription_request(&self, topic: &str) -> Option<String> {
        self.lock()
            .subscriptions
            .get(topic)
            .and_then(|entry| entry.request.clone())
    }

    fn has_consumers(&self) -> bool {
        !self.lock().subscriptions.is_empty()
    }

    /// Mark the connection lost; live topics go back to `Subscribing`
    fn mark_reconnecting(&self) {
        let topics: Vec<String> = {
            let mut shared = self.lock();
            shared.status = ConnectionStatus::Reconnecting;
            shared.subscriptions.keys().cloned().collect()
        };
        for topic in topics {
            if matches!(
                self.router.state(&topic),
                TopicState::Active | TopicState::Subscribing
            ) {
                self.router.set_state(&topic, TopicState::Subscribing);
            }
        }
    }

    /// Open a new session and return the frames to replay on it
    ///
    /// The authentication frame comes first, then every subscribe frame in
    /// subscription order with duplicates removed. Desynced topics wait for an
    /// explicit resubscribe.
    fn begin_session(&self) -> Vec<String> {
        let mut shared = self.lock();
        shared.epoch += 1;
        shared.status = ConnectionStatus::Open;

        let mut entries: Vec<(u64, &String)> = shared
            .subscriptions
            .iter()
            .filter(|(topic, _)| self.router.state(topic) != TopicState::Desynced)
            .filter_map(|(_, entry)| entry.request.as_ref().map(|r| (entry.seq, r)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);

        let mut frames = Vec::new();
        if let Some(auth) = &shared.auth {
            frames.push(auth.request.clone());
        }
        let mut seen = HashSet::new();
        for (_, request) in entries {
            if seen.insert(request.as_str()) {
                frames.push(request.clone());
            }
        }
        frames
    }

    /// Forget the authentication and return the topics it covered
    fn revoke_authentication(&self, topic: &str) -> BTreeSet<String> {
        let mut shared = self.lock();
        let mut topics: BTreeSet<String> = shared
            .subscriptions
            .keys()
            .filter(|t| self.adapter.is_private(t))
            .cloned()
            .collect();
        if let Some(auth) = shared.auth.take() {
            topics.insert(auth.ack_topic);
        }
        if !topic.is_empty() {
            topics.insert(topic.to_string());
        }
        topics
    }
}

/// Consumer handle for one or more topics
///
/// Holds a reference on every topic; dropping the last handle unsubscribes.
pub struct Subscription {
    watcher: Watcher,
    topics: Vec<String>,
    connection: Weak<Connection>,
}

impl Subscription {
    /// Wait for the next update of any watched topic
    pub async fn recv(&mut self) -> Result<TopicUpdate> {
        self.watcher.recv().await
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.router.deregister(self.watcher.id());
            connection.release(&self.topics, false);
        }
    }
}

async fn write_frames(client: &mut WebSocketClient, frames: Vec<String>) -> Result<()> {
    for frame in frames {
        client.send_text(frame).await?;
    }
    Ok(())
}

/// State owned by the dispatch task
struct Worker {
    connection: Arc<Connection>,
    store: TopicStore,
    snapshots: SnapshotLoader,
    /// Topics with a REST snapshot in flight
    fetching: HashSet<String>,
    outbound: mpsc::Receiver<Outbound>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Worker {
    async fn run(mut self, mut client: WebSocketClient) {
        let connection = self.connection.clone();
        loop {
            match self.session(&mut client).await {
                SessionEnd::Shutdown => {
                    client.close().await;
                    break;
                }
                SessionEnd::Lost(err) => {
                    warn!(url = %connection.url, error = %err, "Connection lost");
                    client.close().await;
                    match self.reconnect().await {
                        Some(next) => client = next,
                        None => break,
                    }
                }
            }
        }

        connection.set_status(ConnectionStatus::Closed);
        connection.router.reject_all(SyncError::TopicClosed(format!(
            "connection to {} closed",
            connection.url
        )));
        info!(url = %connection.url, "Connection closed");
    }

    async fn session(&mut self, client: &mut WebSocketClient) -> SessionEnd {
        let connection = self.connection.clone();
        let epoch = connection.lock().epoch;
        let period = connection.venue.keepalive_interval();
        let pong_timeout = connection.venue.pong_timeout();

        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let frames = match command {
                        None | Some(Command::Shutdown) => return SessionEnd::Shutdown,
                        Some(Command::Discard(topic)) => {
                            self.discard(&topic);
                            Vec::new()
                        }
                        Some(Command::Snapshot { topic, result, attempt }) => {
                            self.on_snapshot(topic, result, attempt)
                        }
                    };
                    if let Err(e) = write_frames(client, frames).await {
                        return SessionEnd::Lost(e);
                    }
                }
                Some((frame_epoch, frame)) = self.outbound.recv() => {
                    if frame_epoch != epoch {
                        trace!(url = %connection.url, "Dropping frame queued for a previous socket");
                        continue;
                    }
                    if let Err(e) = client.send_text(frame).await {
                        return SessionEnd::Lost(e);
                    }
                }
                inbound = client.recv() => match inbound {
                    Ok(Some(Inbound::Text(text))) => {
                        last_seen = Instant::now();
                        let frames = self.dispatch(&text);
                        if let Err(e) = write_frames(client, frames).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Ok(Some(Inbound::Heartbeat)) => last_seen = Instant::now(),
                    Ok(None) => {}
                    Err(e) => return SessionEnd::Lost(e),
                },
                _ = keepalive.tick() => {
                    let idle = last_seen.elapsed();
                    if idle > pong_timeout {
                        warn!(
                            url = %connection.url,
                            idle_ms = idle.as_millis() as u64,
                            "No traffic within pong timeout"
                        );
                        return SessionEnd::Lost(SyncError::ConnectionTimeout);
                    }
                    let sent = match connection.adapter.ping_request() {
                        Some(ping) => client.send_text(ping).await,
                        None => client.ping().await,
                    };
                    if let Err(e) = sent {
                        warn!(url = %connection.url, error = %e, "Failed to send keepalive ping");
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Decode and apply one inbound frame; returns frames to write
    fn dispatch(&mut self, text: &str) -> Vec<String> {
        let connection = self.connection.clone();
        connection
            .metrics
            .frames
            .with_label_values(&[&connection.url])
            .inc();

        match connection.adapter.decode(text) {
            Ok(decoded) => self.apply(decoded),
            Err(e) => {
                connection
                    .metrics
                    .protocol_errors
                    .with_label_values(&[&connection.url])
                    .inc();
                warn!(url = %connection.url, error = %e, "Dropping undecodable frame");
                Vec::new()
            }
        }
    }

    /// Apply the operations of one frame, then publish the coalesced results
    fn apply(&mut self, decoded: Vec<Decoded>) -> Vec<String> {
        let connection = self.connection.clone();
        let incremental = connection.venue.new_updates;
        let mut resolutions: Vec<Resolution> = Vec::new();
        let mut frames = Vec::new();

        for Decoded { topic, op } in decoded {
            let op = match op {
                Operation::Pong => continue,
                Operation::Error(err) => {
                    self.on_venue_error(&topic, err);
                    continue;
                }
                Operation::AuthAck => Operation::AuthAck,
                op if connection.accepts(&topic) => op,
                _ => {
                    trace!(topic = %topic, "Dropping update for inactive topic");
                    continue;
                }
            };

            let is_delta = matches!(op, Operation::Delta(_));
            match self.store.apply(&topic, op) {
                Ok(values) => {
                    for (key, value) in values {
                        match resolutions.iter_mut().find(|(k, _)| *k == key) {
                            Some(slot) if incremental => {
                                if !slot.1.merge(&value, usize::MAX) {
                                    slot.1 = value;
                                }
                            }
                            Some(slot) => slot.1 = value,
                            None => resolutions.push((key, value)),
                        }
                    }
                    if is_delta
                        && self.store.awaiting_snapshot(&topic)
                        && !self.fetching.contains(&topic)
                    {
                        self.request_snapshot(&topic, 1);
                    }
                }
                Err(SyncError::Desync(reason)) => {
                    resolutions.retain(|(key, _)| *key != topic);
                    frames.extend(self.on_desync(&topic, reason));
                }
                Err(e) => {
                    connection
                        .metrics
                        .protocol_errors
                        .with_label_values(&[&connection.url])
                        .inc();
                    warn!(url = %connection.url, topic = %topic, error = %e, "Dropping operation");
                }
            }
        }

        for (key, value) in resolutions {
            let batch = matches!(
                value,
                TopicValue::Trades(_) | TopicValue::Candles(_) | TopicValue::Orders(_)
            );
            if incremental && batch {
                connection.router.resolve_incremental(&key, value);
            } else {
                connection.router.resolve(&key, value);
            }
            connection
                .metrics
                .resolutions
                .with_label_values(&[&connection.url])
                .inc();
        }

        frames
    }

    fn on_desync(&mut self, topic: &str, reason: DesyncReason) -> Vec<String> {
        let connection = self.connection.clone();
        warn!(url = %connection.url, topic, reason = %reason, "Order book desync");
        connection
            .metrics
            .desyncs
            .with_label_values(&[&connection.url, reason.label()])
            .inc();

        self.store.remove(topic);
        self.fetching.remove(topic);
        connection.router.reject(topic, SyncError::Desync(reason));

        if !connection.venue.resubscribe_on_desync {
            return Vec::new();
        }
        let Some(request) = connection.subscription_request(topic) else {
            return Vec::new();
        };

        connection.router.set_state(topic, TopicState::Subscribing);
        let mut frames = Vec::new();
        if let Some(unsubscribe) = connection.adapter.unsubscribe_request(topic) {
            frames.push(unsubscribe);
        }
        frames.push(request);
        frames
    }

    fn on_venue_error(&mut self, topic: &str, err: VenueError) {
        let connection = self.connection.clone();
        let error = SyncError::from(err);
        warn!(url = %connection.url, topic, error = %error, "Venue reported an error");

        if matches!(error, SyncError::Authentication(_)) {
            for private in connection.revoke_authentication(topic) {
                connection.router.reject(&private, error.clone());
            }
        } else if !topic.is_empty() {
            connection.router.reject(topic, error);
        }
    }

    fn request_snapshot(&mut self, topic: &str, attempt: u32) {
        let Some(url) = self.connection.adapter.snapshot_url(topic) else {
            return;
        };
        debug!(topic, attempt, "Requesting order book snapshot");

        self.fetching.insert(topic.to_string());
        let loader = self.snapshots.clone();
        let commands = self.connection.commands.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let result = loader.fetch(url).await;
            let _ = commands.send(Command::Snapshot {
                topic,
                result,
                attempt,
            });
        });
    }

    fn on_snapshot(&mut self, topic: String, result: Result<BookSnapshot>, attempt: u32) -> Vec<String> {
        // Results for discarded books are stale
        if !self.fetching.remove(&topic) || !self.connection.accepts(&topic) {
            return Vec::new();
        }

        let error = match result {
            Ok(snapshot) if self.store.snapshot_bridges(&topic, snapshot.nonce) => {
                return self.apply(vec![Decoded::new(topic, Operation::Snapshot(snapshot))]);
            }
            Ok(snapshot) => SyncError::RestApi(format!(
                "snapshot at nonce {} is older than the buffered deltas",
                snapshot.nonce
            )),
            Err(e) => e,
        };

        if attempt <= self.connection.venue.snapshot_max_retries {
            debug!(topic = %topic, attempt, error = %error, "Retrying order book snapshot");
            self.request_snapshot(&topic, attempt + 1);
        } else {
            warn!(topic = %topic, attempt, error = %error, "Giving up on order book snapshot");
            self.store.remove(&topic);
            self.connection.router.clear_latest(&topic);
            self.connection.router.reject(&topic, error);
        }
        Vec::new()
    }

    fn discard(&mut self, topic: &str) {
        self.store.remove(topic);
        self.fetching.remove(topic);
    }

    /// Forget every book and its last published value before a new session
    fn reset_books(&mut self) {
        self.connection.mark_reconnecting();
        for topic in self.store.clear_books() {
            self.connection.router.clear_latest(&topic);
        }
        self.fetching.clear();
    }

    /// Reopen the socket with exponential backoff and replay subscriptions
    ///
    /// Returns `None` when shut down, when every consumer has gone away, or
    /// after the maximum number of attempts.
    async fn reconnect(&mut self) -> Option<WebSocketClient> {
        let connection = self.connection.clone();
        self.reset_books();

        let base = connection.venue.reconnect_delay();
        let max_attempts = connection.venue.max_reconnect_attempts;
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if max_attempts > 0 && attempt > max_attempts {
                error!(url = %connection.url, attempts = max_attempts, "Giving up on reconnect");
                connection
                    .router
                    .reject_all(SyncError::MaxReconnectAttemptsExceeded);
                return None;
            }

            let delay = backoff_delay(base, attempt);
            warn!(
                url = %connection.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting..."
            );
            if !self.wait(delay).await {
                return None;
            }
            if !connection.has_consumers() {
                info!(url = %connection.url, "No consumers left, abandoning reconnect");
                return None;
            }

            let mut client = match WebSocketClient::connect(&connection.url).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(url = %connection.url, attempt, error = %e, "Reconnect failed");
                    continue;
                }
            };

            let frames = connection.begin_session();
            let replayed = frames.len();
            match write_frames(&mut client, frames).await {
                Ok(()) => {
                    connection
                        .metrics
                        .reconnects
                        .with_label_values(&[&connection.url])
                        .inc();
                    info!(url = %connection.url, attempt, replayed, "Reconnected");
                    return Some(client);
                }
                Err(e) => {
                    warn!(url = %connection.url, error = %e, "Replay failed");
                    connection.set_status(ConnectionStatus::Reconnecting);
                    client.close().await;
                }
            }
        }
    }

    /// Sleep while still serving commands; `false` means shut down
    async fn wait(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::Discard(topic)) => self.discard(&topic),
                    Some(Command::Snapshot { .. }) => {}
                },
            }
        }
    }
}

/// Delay before reconnect `attempt`, doubling from `base` up to [`MAX_BACKOFF`]
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(6);
    base.max(Duration::from_millis(1))
        .saturating_mul(factor)
        .min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::message::{Record, Trade, TradeSide, VenueErrorKind};
    use crate::orderbook::{BookDelta, Level};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    const BOOK: &str = "orderbook:BTC/USD";
    const TRADES: &str = "trades:BTC/USD";

    fn connection(adapter: MockAdapter, venue: VenueConfig) -> (Arc<Connection>, Worker) {
        Connection::new(
            "ws://venue.test",
            Arc::new(venue),
            Arc::new(adapter),
            SyncMetrics::new().unwrap(),
        )
        .unwrap()
    }

    fn topics(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn trade(id: &str) -> Record {
        Record::Trade(Trade {
            id: id.to_string(),
            symbol: "BTC/USD".to_string(),
            timestamp: 1,
            price: dec!(100),
            amount: dec!(1),
            side: TradeSide::Buy,
        })
    }

    fn snapshot(nonce: u64) -> Operation {
        Operation::Snapshot(BookSnapshot {
            bids: vec![Level::new(dec!(100), dec!(1))],
            asks: vec![Level::new(dec!(101), dec!(2))],
            nonce,
            timestamp: None,
        })
    }

    #[test]
    fn test_subscribe_frame_sent_once_per_topic() {
        let mut adapter = MockAdapter::new();
        adapter
            .expect_unsubscribe_request()
            .returning(|topic| Some(format!("unsub:{topic}")));
        let (conn, mut worker) = connection(adapter, VenueConfig::default());

        let first = conn.retain(&topics(&[TRADES]), Some("sub".to_string()));
        assert_eq!(first, Some((0, "sub".to_string())));
        let second = conn.retain(&topics(&[TRADES]), Some("sub".to_string()));
        assert_eq!(second, None);
        assert_eq!(conn.ref_count(TRADES), 2);
        assert_eq!(conn.router().state(TRADES), TopicState::Subscribing);

        assert_eq!(conn.release(&topics(&[TRADES]), false), 0);
        assert!(worker.outbound.try_recv().is_err());

        assert_eq!(conn.release(&topics(&[TRADES]), false), 1);
        assert_eq!(
            worker.outbound.try_recv().unwrap(),
            (0, format!("unsub:{TRADES}"))
        );
        assert_eq!(conn.router().state(TRADES), TopicState::Unsubscribed);
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let mut adapter = MockAdapter::new();
        adapter
            .expect_decode()
            .returning(|_| Err(SyncError::Protocol("garbage".to_string())));
        let (conn, mut worker) = connection(adapter, VenueConfig::default());
        conn.retain(&topics(&[TRADES]), None);

        assert!(worker.dispatch("not json").is_empty());
        assert_eq!(
            conn.metrics
                .protocol_errors
                .with_label_values(&["ws://venue.test"])
                .get(),
            1
        );
        assert_eq!(conn.router().state(TRADES), TopicState::Subscribing);
    }

    #[test]
    fn test_updates_for_unsubscribed_topics_are_ignored() {
        let mut adapter = MockAdapter::new();
        adapter
            .expect_decode()
            .returning(|_| Ok(vec![Decoded::new(TRADES, Operation::Append(vec![trade("1")]))]));
        let (conn, mut worker) = connection(adapter, VenueConfig::default());

        worker.dispatch("{}");
        assert!(conn.router().latest(TRADES).is_none());
        assert!(worker.store.get(TRADES).is_none());
    }

    #[test]
    fn test_frame_resolves_waiter_and_activates_topic() {
        let mut adapter = MockAdapter::new();
        adapter.expect_decode().returning(|_| {
            Ok(vec![Decoded::new(
                TRADES,
                Operation::Append(vec![trade("1"), trade("2")]),
            )])
        });
        let (conn, mut worker) = connection(adapter, VenueConfig::default());
        let mut watcher = conn.router().register(&topics(&[TRADES]), WaitMode::Once);
        conn.retain(&topics(&[TRADES]), Some("sub".to_string()));

        let mut recv = task::spawn(watcher.recv());
        assert_pending!(recv.poll());
        worker.dispatch("{}");
        let update = assert_ready_ok!(recv.poll());
        match update.value.as_ref() {
            TopicValue::Trades(trades) => assert_eq!(trades.len(), 2),
            other => panic!("Expected trades, got {other:?}"),
        }
        assert_eq!(conn.router().state(TRADES), TopicState::Active);
    }

    #[test]
    fn test_desync_in_frame_suppresses_resolution_and_resubscribes() {
        let mut adapter = MockAdapter::new();
        adapter.expect_decode().returning(|_| {
            Ok(vec![
                Decoded::new(BOOK, snapshot(5)),
                Decoded::new(
                    BOOK,
                    Operation::Delta(BookDelta {
                        bids: vec![Level::new(dec!(99), dec!(1))],
                        nonce: 7,
                        ..Default::default()
                    }),
                ),
            ])
        });
        adapter
            .expect_unsubscribe_request()
            .returning(|topic| Some(format!("unsub:{topic}")));
        let (conn, mut worker) = connection(adapter, VenueConfig::default());
        let mut watcher = conn.router().register(&topics(&[BOOK]), WaitMode::Stream);
        conn.retain(&topics(&[BOOK]), Some("sub:book".to_string()));

        let frames = worker.dispatch("{}");
        assert_eq!(frames, vec![format!("unsub:{BOOK}"), "sub:book".to_string()]);
        assert_eq!(conn.router().state(BOOK), TopicState::Subscribing);
        assert!(conn.router().latest(BOOK).is_none());
        assert!(worker.store.get(BOOK).is_none());

        let mut recv = task::spawn(watcher.recv());
        let err = assert_ready_err!(recv.poll());
        assert_eq!(
            err,
            SyncError::Desync(DesyncReason::SequenceGap { expected: 6, got: 7 })
        );
    }

    #[test]
    fn test_desync_without_resubscribe_stays_desynced() {
        let mut adapter = MockAdapter::new();
        adapter.expect_decode().returning(|_| {
            Ok(vec![
                Decoded::new(BOOK, snapshot(5)),
                Decoded::new(BOOK, Operation::Checksum(12345)),
            ])
        });
        let venue = VenueConfig {
            resubscribe_on_desync: false,
            ..Default::default()
        };
        let (conn, mut worker) = connection(adapter, venue);
        conn.retain(&topics(&[BOOK]), Some("sub:book".to_string()));

        assert!(worker.dispatch("{}").is_empty());
        assert_eq!(conn.router().state(BOOK), TopicState::Desynced);

        // Further updates are ignored until the topic is watched again
        worker.dispatch("{}");
        assert!(conn.router().latest(BOOK).is_none());

        let resend = conn.retain(&topics(&[BOOK]), Some("sub:book".to_string()));
        assert_eq!(resend, Some((0, "sub:book".to_string())));
        assert_eq!(conn.router().state(BOOK), TopicState::Subscribing);
    }

    #[test]
    fn test_reconnect_replays_auth_then_subscriptions_in_order() {
        let (conn, mut worker) = connection(MockAdapter::new(), VenueConfig::default());
        conn.retain(&topics(&[BOOK]), Some("sub:book".to_string()));
        conn.retain(&topics(&[TRADES]), Some("sub:trades".to_string()));
        conn.retain(&topics(&["orders:A", "orders:B"]), Some("sub:orders".to_string()));
        conn.lock().auth = Some(Authentication {
            request: "auth".to_string(),
            ack_topic: "auth".to_string(),
        });
        conn.router().set_state(BOOK, TopicState::Active);
        worker
            .store
            .apply(BOOK, snapshot(5))
            .unwrap();

        worker.reset_books();
        assert_eq!(conn.status(), ConnectionStatus::Reconnecting);
        assert_eq!(conn.router().state(BOOK), TopicState::Subscribing);
        assert!(worker.store.get(BOOK).is_none());

        let frames = conn.begin_session();
        assert_eq!(frames, vec!["auth", "sub:book", "sub:trades", "sub:orders"]);
        assert_eq!(conn.status(), ConnectionStatus::Open);
        assert_eq!(conn.lock().epoch, 1);
    }

    #[test]
    fn test_auth_failure_rejects_private_topics_only() {
        let mut adapter = MockAdapter::new();
        adapter.expect_decode().returning(|_| {
            Ok(vec![Decoded::new(
                "",
                Operation::Error(VenueError {
                    kind: VenueErrorKind::Auth,
                    message: "invalid key".to_string(),
                }),
            )])
        });
        adapter
            .expect_is_private()
            .returning(|topic| topic.starts_with("orders"));
        let (conn, mut worker) = connection(adapter, VenueConfig::default());

        let mut orders = conn.router().register(&topics(&["orders"]), WaitMode::Stream);
        let mut trades = conn.router().register(&topics(&[TRADES]), WaitMode::Stream);
        conn.retain(&topics(&["orders"]), Some("sub:orders".to_string()));
        conn.retain(&topics(&[TRADES]), Some("sub:trades".to_string()));

        worker.dispatch("{}");

        let mut recv = task::spawn(orders.recv());
        assert!(matches!(
            assert_ready_err!(recv.poll()),
            SyncError::Authentication(_)
        ));
        assert_eq!(conn.router().waiter_count("orders"), 0);

        let mut recv = task::spawn(trades.recv());
        assert_pending!(recv.poll());
        assert_eq!(conn.router().waiter_count(TRADES), 1);
    }

    #[test]
    fn test_stale_snapshot_results_are_ignored() {
        let (conn, mut worker) = connection(MockAdapter::new(), VenueConfig::default());
        conn.retain(&topics(&[BOOK]), None);

        let frames = worker.on_snapshot(
            BOOK.to_string(),
            Err(SyncError::RestApi("timeout".to_string())),
            1,
        );
        assert!(frames.is_empty());
        assert_eq!(conn.router().state(BOOK), TopicState::Subscribing);
    }

    #[test]
    fn test_reconnect_forgets_latest_book_but_keeps_trades() {
        let mut adapter = MockAdapter::new();
        adapter.expect_decode().returning(|_| {
            Ok(vec![
                Decoded::new(BOOK, snapshot(5)),
                Decoded::new(TRADES, Operation::Append(vec![trade("1")])),
            ])
        });
        let (conn, mut worker) = connection(adapter, VenueConfig::default());
        conn.retain(&topics(&[BOOK]), Some("sub:book".to_string()));
        conn.retain(&topics(&[TRADES]), Some("sub:trades".to_string()));

        worker.dispatch("{}");
        assert!(conn.router().latest(BOOK).is_some());

        worker.reset_books();
        assert!(conn.router().latest(BOOK).is_none());
        assert!(conn.router().latest(TRADES).is_some());
    }

    #[test]
    fn test_abandoned_snapshot_forgets_latest_book() {
        let (conn, mut worker) = connection(MockAdapter::new(), VenueConfig {
            snapshot_max_retries: 0,
            ..Default::default()
        });
        conn.retain(&topics(&[BOOK]), None);
        worker.store.apply(BOOK, snapshot(5)).unwrap();
        conn.router().resolve(BOOK, TopicValue::Authenticated);
        worker.fetching.insert(BOOK.to_string());

        worker.on_snapshot(BOOK.to_string(), Err(SyncError::RestApi("timeout".to_string())), 1);
        assert!(conn.router().latest(BOOK).is_none());
        assert!(worker.store.get(BOOK).is_none());
    }

    #[test]
    fn test_account_stream_accepted_for_symbol_subscriptions() {
        let (conn, _worker) = connection(MockAdapter::new(), VenueConfig::default());
        conn.retain(&topics(&["orders:BTC/USD"]), Some("sub".to_string()));

        assert!(conn.accepts("orders:BTC/USD"));
        assert!(conn.accepts("orders"));
        assert!(!conn.accepts("orders:ETH/USD"));
        assert!(!conn.accepts("trades"));
    }

    #[test]
    fn test_new_updates_merge_frames_for_lagging_stream() {
        let mut adapter = MockAdapter::new();
        let mut next = 0;
        adapter.expect_decode().returning(move |_| {
            next += 1;
            Ok(vec![Decoded::new(TRADES, Operation::Append(vec![trade(&next.to_string())]))])
        });
        let venue = VenueConfig {
            new_updates: true,
            ..Default::default()
        };
        let (conn, mut worker) = connection(adapter, venue);
        let mut watcher = conn.router().register(&topics(&[TRADES]), WaitMode::Stream);
        conn.retain(&topics(&[TRADES]), Some("sub".to_string()));

        worker.dispatch("{}");
        worker.dispatch("{}");
        let ids = |update: TopicUpdate| match update.value.as_ref() {
            TopicValue::Trades(trades) => trades.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            other => panic!("Expected trades, got {other:?}"),
        };
        let mut recv = task::spawn(watcher.recv());
        assert_eq!(ids(assert_ready_ok!(recv.poll())), ["1", "2"]);
        drop(recv);

        worker.dispatch("{}");
        let mut recv = task::spawn(watcher.recv());
        assert_eq!(ids(assert_ready_ok!(recv.poll())), ["3"]);
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::ZERO, 1), Duration::from_millis(1));
        assert_eq!(backoff_delay(Duration::from_millis(u64::MAX), 7), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::MAX, u32::MAX), MAX_BACKOFF);
    }
}
