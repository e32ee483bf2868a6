//! Subscription router
//!
//! Maps topic keys to pending waiters. A waiter is a `watch` channel shared by
//! every key it was registered against: one-shot waiters are dropped after
//! their first resolution, stream waiters stay until deregistered or rejected
//! with a fatal error. Versions come from one counter per router, so a stream
//! never observes an older value after a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Result, SyncError};
use crate::message::{Candle, Order, Trade};
use crate::orderbook::BookView;

/// Lifecycle of one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicState {
    #[default]
    Unsubscribed,
    Subscribing,
    Active,
    Desynced,
}

/// Value published for a topic
#[derive(Debug, Clone, PartialEq)]
pub enum TopicValue {
    OrderBook(BookView),
    Trades(Vec<Trade>),
    Candles(Vec<Candle>),
    Orders(Vec<Order>),
    Authenticated,
}

impl TopicValue {
    /// Fold a later batch of records into this one, keeping at most `limit`
    ///
    /// Trades are appended, candles replace a tail with the same timestamp and
    /// orders replace the entry with the same symbol and id. Returns `false`
    /// when the two values are not record batches of the same kind.
    pub fn merge(&mut self, newer: &TopicValue, limit: usize) -> bool {
        match (self, newer) {
            (TopicValue::Trades(old), TopicValue::Trades(new)) => {
                old.extend(new.iter().cloned());
                keep_last(old, limit);
            }
            (TopicValue::Candles(old), TopicValue::Candles(new)) => {
                for candle in new {
                    match old.last_mut() {
                        Some(last) if last.timestamp == candle.timestamp => *last = candle.clone(),
                        _ => old.push(candle.clone()),
                    }
                }
                keep_last(old, limit);
            }
            (TopicValue::Orders(old), TopicValue::Orders(new)) => {
                for order in new {
                    match old
                        .iter_mut()
                        .find(|o| o.symbol == order.symbol && o.id == order.id)
                    {
                        Some(existing) => *existing = order.clone(),
                        None => old.push(order.clone()),
                    }
                }
                keep_last(old, limit);
            }
            _ => return false,
        }
        true
    }
}

fn keep_last<T>(records: &mut Vec<T>, limit: usize) {
    let excess = records.len().saturating_sub(limit);
    records.drain(..excess);
}

/// One resolution of a topic
#[derive(Debug, Clone)]
pub struct TopicUpdate {
    pub topic: String,
    pub version: u64,
    pub value: Arc<TopicValue>,
}

/// How long a waiter stays registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Resolved exactly once, then removed
    Once,
    /// Re-awaited for every update until dropped
    Stream,
}

type Slot = Option<Result<TopicUpdate>>;

struct Waiter {
    mode: WaitMode,
    keys: Vec<String>,
    tx: watch::Sender<Slot>,
    /// Version of the last update a receiver took out of the slot
    seen: Arc<AtomicU64>,
}

#[derive(Default)]
struct TopicEntry {
    state: TopicState,
    latest: Option<TopicUpdate>,
    waiters: Vec<u64>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicEntry>,
    waiters: HashMap<u64, Waiter>,
    next_waiter: u64,
    version: u64,
}

impl Inner {
    /// Drop a waiter from every key it is registered on
    fn remove_waiter(&mut self, id: u64) {
        let Some(waiter) = self.waiters.remove(&id) else {
            return;
        };
        for key in &waiter.keys {
            if let Some(entry) = self.topics.get_mut(key) {
                entry.waiters.retain(|w| *w != id);
            }
        }
    }
}

/// Handle returned by [`Router::register`]
pub struct Watcher {
    id: u64,
    rx: watch::Receiver<Slot>,
    seen: Arc<AtomicU64>,
}

impl Watcher {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next resolution or rejection
    ///
    /// Fails with `TopicClosed` once the waiter has been removed from the router
    /// and its last value was consumed.
    pub async fn recv(&mut self) -> Result<TopicUpdate> {
        loop {
            if self.rx.changed().await.is_err() {
                return Err(SyncError::TopicClosed(format!("waiter {}", self.id)));
            }
            let slot = {
                let current = self.rx.borrow_and_update();
                // Marked while the slot is borrowed so a concurrent merge
                // either sees it or is observed by this read
                if let Some(Ok(update)) = &*current {
                    self.seen.fetch_max(update.version, Ordering::AcqRel);
                }
                (*current).clone()
            };
            if let Some(slot) = slot {
                return slot;
            }
        }
    }
}

/// Per-topic waiter registry and state machine
pub struct Router {
    inner: Mutex<Inner>,
    /// Most records an incremental update may accumulate for a lagging stream
    merge_limit: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_merge_limit(usize::MAX)
    }

    pub fn with_merge_limit(merge_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            merge_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter on one or more keys
    ///
    /// A one-shot waiter on a single key joins the pending one-shot for that
    /// key when there is one.
    pub fn register(&self, keys: &[String], mode: WaitMode) -> Watcher {
        let mut inner = self.lock();

        if let (WaitMode::Once, [key]) = (mode, keys) {
            let existing = inner.topics.get(key).and_then(|entry| {
                entry.waiters.iter().copied().find(|id| {
                    inner
                        .waiters
                        .get(id)
                        .map(|w| w.mode == WaitMode::Once && w.keys.len() == 1)
                        .unwrap_or(false)
                })
            });
            if let Some(id) = existing {
                if let Some(waiter) = inner.waiters.get(&id) {
                    return Watcher {
                        id,
                        rx: waiter.tx.subscribe(),
                        seen: waiter.seen.clone(),
                    };
                }
            }
        }

        let id = inner.next_waiter;
        inner.next_waiter += 1;

        let (tx, rx) = watch::channel(None);
        let seen = Arc::new(AtomicU64::new(0));
        for key in keys {
            inner.topics.entry(key.clone()).or_default().waiters.push(id);
        }
        inner.waiters.insert(
            id,
            Waiter {
                mode,
                keys: keys.to_vec(),
                tx,
                seen: seen.clone(),
            },
        );

        trace!(id, keys = ?keys, mode = ?mode, "Waiter registered");
        Watcher { id, rx, seen }
    }

    /// Remove a waiter unless other handles still share it
    pub fn deregister(&self, id: u64) {
        let mut inner = self.lock();
        let shared = inner
            .waiters
            .get(&id)
            .map(|w| w.tx.receiver_count() > 1)
            .unwrap_or(false);
        if !shared {
            inner.remove_waiter(id);
        }
    }

    /// Publish a new value and wake every waiter on the key
    ///
    /// Keys nobody subscribed or waits on are not stored.
    pub fn resolve(&self, topic: &str, value: TopicValue) -> u64 {
        self.publish(topic, value, false)
    }

    /// Publish a batch of new records
    ///
    /// A stream waiter that has not taken its previous batch yet receives
    /// both batches merged instead of losing the older one.
    pub fn resolve_incremental(&self, topic: &str, value: TopicValue) -> u64 {
        self.publish(topic, value, true)
    }

    fn publish(&self, topic: &str, value: TopicValue, incremental: bool) -> u64 {
        let mut inner = self.lock();
        inner.version += 1;
        let update = TopicUpdate {
            topic: topic.to_string(),
            version: inner.version,
            value: Arc::new(value),
        };

        let Some(entry) = inner.topics.get_mut(topic) else {
            trace!(topic, "No interest in key, update not stored");
            return update.version;
        };
        if entry.state == TopicState::Subscribing {
            entry.state = TopicState::Active;
        }
        entry.latest = Some(update.clone());
        let ids = entry.waiters.clone();

        let mut finished = Vec::new();
        for id in ids {
            let Some(waiter) = inner.waiters.get(&id) else {
                continue;
            };
            if waiter.tx.receiver_count() == 0 {
                finished.push(id);
                continue;
            }
            if incremental && waiter.mode == WaitMode::Stream {
                let seen = waiter.seen.clone();
                let limit = self.merge_limit;
                waiter.tx.send_modify(|slot| {
                    let merged = match slot {
                        Some(Ok(pending))
                            if pending.topic == update.topic
                                && pending.version > seen.load(Ordering::Acquire) =>
                        {
                            let mut value = pending.value.as_ref().clone();
                            value.merge(&update.value, limit).then_some(value)
                        }
                        _ => None,
                    };
                    let next = match merged {
                        Some(value) => TopicUpdate {
                            value: Arc::new(value),
                            ..update.clone()
                        },
                        None => update.clone(),
                    };
                    *slot = Some(Ok(next));
                });
            } else {
                waiter.tx.send_replace(Some(Ok(update.clone())));
            }
            if waiter.mode == WaitMode::Once {
                finished.push(id);
            }
        }
        for id in finished {
            inner.remove_waiter(id);
        }

        trace!(topic, version = update.version, "Topic resolved");
        update.version
    }

    /// Deliver an error to every waiter on the key
    ///
    /// One-shot waiters are removed; stream waiters are removed only for fatal
    /// errors. A desync marks the topic `Desynced` and forgets its last value.
    pub fn reject(&self, topic: &str, error: SyncError) {
        let mut inner = self.lock();
        let Some(entry) = inner.topics.get_mut(topic) else {
            return;
        };
        if matches!(error, SyncError::Desync(_)) {
            entry.state = TopicState::Desynced;
            entry.latest = None;
        }
        let ids = entry.waiters.clone();
        let fatal = error.is_fatal();

        let mut finished = Vec::new();
        for id in ids {
            let Some(waiter) = inner.waiters.get(&id) else {
                continue;
            };
            waiter.tx.send_replace(Some(Err(error.clone())));
            if fatal || waiter.mode == WaitMode::Once {
                finished.push(id);
            }
        }
        for id in finished {
            inner.remove_waiter(id);
        }

        debug!(topic, error = %error, "Topic rejected");
    }

    /// Reject every known topic
    pub fn reject_all(&self, error: SyncError) {
        for topic in self.topic_keys() {
            self.reject(&topic, error.clone());
        }
    }

    /// Cancel every waiter with `TopicClosed` and forget the topic
    pub fn close(&self, topic: &str) {
        self.reject(topic, SyncError::TopicClosed(topic.to_string()));
        let mut inner = self.lock();
        if let Some(entry) = inner.topics.get_mut(topic) {
            entry.state = TopicState::Unsubscribed;
            entry.latest = None;
            if entry.waiters.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }

    /// Forget the last value of a key without notifying its waiters
    pub fn clear_latest(&self, topic: &str) {
        if let Some(entry) = self.lock().topics.get_mut(topic) {
            entry.latest = None;
        }
    }

    pub fn set_state(&self, topic: &str, state: TopicState) {
        let mut inner = self.lock();
        inner.topics.entry(topic.to_string()).or_default().state = state;
    }

    pub fn state(&self, topic: &str) -> TopicState {
        self.lock()
            .topics
            .get(topic)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Last value resolved for the key
    pub fn latest(&self, topic: &str) -> Option<TopicUpdate> {
        self.lock().topics.get(topic).and_then(|e| e.latest.clone())
    }

    /// Number of waiters registered on the key
    pub fn waiter_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|e| e.waiters.len())
            .unwrap_or(0)
    }

    fn topic_keys(&self) -> Vec<String> {
        self.lock().topics.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DesyncReason;
    use crate::message::OrderStatus;
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok, task};

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_once_waiter_stays_pending_until_resolved() {
        let router = Router::new();
        let mut watcher = router.register(&keys(&["trades:BTC/USD"]), WaitMode::Once);

        let mut recv = task::spawn(watcher.recv());
        assert_pending!(recv.poll());

        router.resolve("trades:BTC/USD", TopicValue::Trades(Vec::new()));
        assert!(recv.is_woken());
        let update = assert_ready_ok!(recv.poll());
        assert_eq!(update.topic, "trades:BTC/USD");
        assert_eq!(router.waiter_count("trades:BTC/USD"), 0);
    }

    #[test]
    fn test_once_waiter_is_closed_after_resolution() {
        let router = Router::new();
        let mut watcher = router.register(&keys(&["t"]), WaitMode::Once);
        router.resolve("t", TopicValue::Authenticated);

        let mut first = task::spawn(watcher.recv());
        assert_ready_ok!(first.poll());
        drop(first);

        let mut second = task::spawn(watcher.recv());
        let err = assert_ready_err!(second.poll());
        assert!(matches!(err, SyncError::TopicClosed(_)));
    }

    #[test]
    fn test_once_waiters_on_same_key_share_one_registration() {
        let router = Router::new();
        let mut a = router.register(&keys(&["t"]), WaitMode::Once);
        let mut b = router.register(&keys(&["t"]), WaitMode::Once);
        assert_eq!(a.id(), b.id());
        assert_eq!(router.waiter_count("t"), 1);

        router.resolve("t", TopicValue::Authenticated);
        let mut ra = task::spawn(a.recv());
        let mut rb = task::spawn(b.recv());
        assert_ready_ok!(ra.poll());
        assert_ready_ok!(rb.poll());
    }

    #[test]
    fn test_stream_waiter_sees_increasing_versions() {
        let router = Router::new();
        let mut watcher = router.register(&keys(&["a", "b"]), WaitMode::Stream);

        let mut last = 0;
        for topic in ["a", "b", "a"] {
            router.resolve(topic, TopicValue::Trades(Vec::new()));
            let mut recv = task::spawn(watcher.recv());
            let update = assert_ready_ok!(recv.poll());
            assert_eq!(update.topic, topic);
            assert!(update.version > last);
            last = update.version;
        }
        assert_eq!(router.waiter_count("a"), 1);
        assert_eq!(router.waiter_count("b"), 1);
    }

    #[test]
    fn test_watch_multiple_resolves_on_any_key() {
        let router = Router::new();
        let mut watcher = router.register(&keys(&["a", "b"]), WaitMode::Once);

        let mut recv = task::spawn(watcher.recv());
        assert_pending!(recv.poll());
        router.resolve("b", TopicValue::Authenticated);
        let update = assert_ready_ok!(recv.poll());
        assert_eq!(update.topic, "b");

        // Removed from the other key as well
        assert_eq!(router.waiter_count("a"), 0);
    }

    #[test]
    fn test_non_fatal_reject_keeps_stream_waiters() {
        let router = Router::new();
        let mut stream = router.register(&keys(&["book"]), WaitMode::Stream);
        let mut once = router.register(&keys(&["book"]), WaitMode::Once);
        router.set_state("book", TopicState::Active);

        let reason = DesyncReason::SequenceGap { expected: 7, got: 9 };
        router.reject("book", SyncError::Desync(reason.clone()));

        assert_eq!(router.state("book"), TopicState::Desynced);
        assert_eq!(router.waiter_count("book"), 1);

        let mut r1 = task::spawn(stream.recv());
        assert_eq!(assert_ready_err!(r1.poll()), SyncError::Desync(reason.clone()));
        let mut r2 = task::spawn(once.recv());
        assert_eq!(assert_ready_err!(r2.poll()), SyncError::Desync(reason));
    }

    #[test]
    fn test_fatal_reject_removes_stream_waiters() {
        let router = Router::new();
        let mut stream = router.register(&keys(&["orders"]), WaitMode::Stream);
        router.reject("orders", SyncError::Authentication("bad key".into()));
        assert_eq!(router.waiter_count("orders"), 0);

        let mut r = task::spawn(stream.recv());
        assert!(matches!(
            assert_ready_err!(r.poll()),
            SyncError::Authentication(_)
        ));
    }

    #[test]
    fn test_close_cancels_pending_waiters() {
        let router = Router::new();
        let mut watcher = router.register(&keys(&["t"]), WaitMode::Stream);
        router.set_state("t", TopicState::Active);

        let mut recv = task::spawn(watcher.recv());
        assert_pending!(recv.poll());
        router.close("t");
        assert!(recv.is_woken());
        let result = assert_ready!(recv.poll());
        assert!(matches!(result, Err(SyncError::TopicClosed(_))));
        assert_eq!(router.state("t"), TopicState::Unsubscribed);
    }

    #[test]
    fn test_first_resolve_activates_subscribing_topic() {
        let router = Router::new();
        router.set_state("t", TopicState::Subscribing);
        router.resolve("t", TopicValue::Authenticated);
        assert_eq!(router.state("t"), TopicState::Active);

        router.set_state("t", TopicState::Desynced);
        router.resolve("t", TopicValue::Authenticated);
        assert_eq!(router.state("t"), TopicState::Desynced);
    }

    #[test]
    fn test_dropped_watchers_are_pruned_on_resolve() {
        let router = Router::new();
        let watcher = router.register(&keys(&["t"]), WaitMode::Stream);
        drop(watcher);
        router.resolve("t", TopicValue::Authenticated);
        assert_eq!(router.waiter_count("t"), 0);
        assert!(router.latest("t").is_some());
    }

    #[test]
    fn test_resolve_without_interest_stores_nothing() {
        let router = Router::new();
        let version = router.resolve("orders:ETH/USD", TopicValue::Orders(Vec::new()));
        assert!(version > 0);
        assert!(router.latest("orders:ETH/USD").is_none());
        assert_eq!(router.state("orders:ETH/USD"), TopicState::Unsubscribed);
    }

    #[test]
    fn test_desync_forgets_latest_value() {
        let router = Router::new();
        let _watcher = router.register(&keys(&["book"]), WaitMode::Stream);
        router.resolve("book", TopicValue::Authenticated);
        assert!(router.latest("book").is_some());

        let reason = DesyncReason::SequenceGap { expected: 3, got: 5 };
        router.reject("book", SyncError::Desync(reason));
        assert!(router.latest("book").is_none());
    }

    #[test]
    fn test_non_desync_reject_keeps_latest_value() {
        let router = Router::new();
        let _watcher = router.register(&keys(&["t"]), WaitMode::Stream);
        router.resolve("t", TopicValue::Authenticated);
        router.reject("t", SyncError::Venue("rate limited".into()));
        assert!(router.latest("t").is_some());

        router.clear_latest("t");
        assert!(router.latest("t").is_none());
        assert_eq!(router.waiter_count("t"), 1);
    }

    fn trade(id: &str) -> Trade {
        Trade {
            id: id.to_string(),
            symbol: "BTC/USD".to_string(),
            timestamp: 1,
            price: rust_decimal_macros::dec!(100),
            amount: rust_decimal_macros::dec!(1),
            side: crate::message::TradeSide::Buy,
        }
    }

    fn trade_ids(update: &TopicUpdate) -> Vec<String> {
        match update.value.as_ref() {
            TopicValue::Trades(trades) => trades.iter().map(|t| t.id.clone()).collect(),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_incremental_updates_merge_until_consumed() {
        let router = Router::with_merge_limit(10);
        let mut watcher = router.register(&keys(&["trades"]), WaitMode::Stream);

        router.resolve_incremental("trades", TopicValue::Trades(vec![trade("1")]));
        router.resolve_incremental("trades", TopicValue::Trades(vec![trade("2")]));
        let mut recv = task::spawn(watcher.recv());
        let update = assert_ready_ok!(recv.poll());
        assert_eq!(trade_ids(&update), ["1", "2"]);
        drop(recv);

        router.resolve_incremental("trades", TopicValue::Trades(vec![trade("3")]));
        let mut recv = task::spawn(watcher.recv());
        let update = assert_ready_ok!(recv.poll());
        assert_eq!(trade_ids(&update), ["3"]);

        // The stored value is the batch, not the merge
        let latest = router.latest("trades").map(|u| trade_ids(&u));
        assert_eq!(latest, Some(vec!["3".to_string()]));
    }

    #[test]
    fn test_incremental_merge_respects_limit() {
        let router = Router::with_merge_limit(2);
        let mut watcher = router.register(&keys(&["trades"]), WaitMode::Stream);
        for id in ["1", "2", "3"] {
            router.resolve_incremental("trades", TopicValue::Trades(vec![trade(id)]));
        }
        let mut recv = task::spawn(watcher.recv());
        let update = assert_ready_ok!(recv.poll());
        assert_eq!(trade_ids(&update), ["2", "3"]);
    }

    #[test]
    fn test_merge_replaces_orders_by_id() {
        let order = |id: &str, status| Order {
            id: id.to_string(),
            symbol: "BTC/USD".to_string(),
            timestamp: 1,
            side: crate::message::TradeSide::Buy,
            price: None,
            amount: rust_decimal_macros::dec!(1),
            filled: rust_decimal::Decimal::ZERO,
            status,
        };
        let mut value = TopicValue::Orders(vec![order("a", OrderStatus::Open)]);
        let newer = TopicValue::Orders(vec![
            order("a", OrderStatus::Closed),
            order("b", OrderStatus::Open),
        ]);
        assert!(value.merge(&newer, 10));
        assert_eq!(
            value,
            TopicValue::Orders(vec![order("a", OrderStatus::Closed), order("b", OrderStatus::Open)])
        );
        assert!(!value.merge(&TopicValue::Authenticated, 10));
    }

    #[test]
    fn test_deregister_respects_shared_handles() {
        let router = Router::new();
        let a = router.register(&keys(&["t"]), WaitMode::Once);
        let b = router.register(&keys(&["t"]), WaitMode::Once);

        router.deregister(a.id());
        assert_eq!(router.waiter_count("t"), 1);
        drop(a);
        router.deregister(b.id());
        assert_eq!(router.waiter_count("t"), 0);
    }
}
