//! Topic state owned by one connection
//!
//! Holds the order books and bounded caches of every topic on a connection and
//! turns decoded operations into values for the router. Only the connection's
//! dispatch task mutates it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{ArrayCache, BoundedCache, SymbolIdCache, TimestampCache};
use crate::config::VenueConfig;
use crate::error::{Result, SyncError};
use crate::message::{Candle, Operation, Order, Record, Trade};
use crate::orderbook::{DeltaOutcome, OrderBook};
use crate::router::TopicValue;

/// State kept for one topic
#[derive(Debug)]
pub enum TopicData {
    Book(OrderBook),
    Trades(ArrayCache<Trade>),
    Candles(TimestampCache<Candle>),
    Orders(SymbolIdCache<Order>),
}

impl TopicData {
    fn kind(&self) -> &'static str {
        match self {
            TopicData::Book(_) => "orderbook",
            TopicData::Trades(_) => "trades",
            TopicData::Candles(_) => "candles",
            TopicData::Orders(_) => "orders",
        }
    }
}

/// A value to publish for a topic key
pub type Resolution = (String, TopicValue);

/// Manages the state of every topic on a connection
#[derive(Debug)]
pub struct TopicStore {
    topics: HashMap<String, TopicData>,
    venue: Arc<VenueConfig>,
}

impl TopicStore {
    pub fn new(venue: Arc<VenueConfig>) -> Self {
        Self {
            topics: HashMap::new(),
            venue,
        }
    }

    /// Apply one operation and return the values to publish
    ///
    /// A desync error leaves the topic's book empty and awaiting a snapshot.
    pub fn apply(&mut self, topic: &str, op: Operation) -> Result<Vec<Resolution>> {
        match op {
            Operation::Snapshot(snapshot) => {
                let depth = self.venue.book_depth;
                let book = self.book_mut(topic)?;
                book.apply_snapshot(snapshot)?;
                let view = book.depth_limited(depth);
                Ok(vec![(topic.to_string(), TopicValue::OrderBook(view))])
            }
            Operation::Delta(delta) => {
                let depth = self.venue.book_depth;
                let book = self.book_mut(topic)?;
                if book.apply_delta(delta)? == DeltaOutcome::Buffered {
                    return Ok(Vec::new());
                }
                let view = book.depth_limited(depth);
                Ok(vec![(topic.to_string(), TopicValue::OrderBook(view))])
            }
            Operation::Checksum(expected) => {
                let checksum = self.venue.checksum.clone();
                if !checksum.enabled {
                    return Ok(Vec::new());
                }
                let book = self.book_mut(topic)?;
                if book.is_synced() {
                    book.verify_checksum(expected, checksum.layout, checksum.depth)?;
                }
                Ok(Vec::new())
            }
            Operation::Append(records) => self.append(topic, records),
            Operation::AuthAck => Ok(vec![(topic.to_string(), TopicValue::Authenticated)]),
            Operation::Pong | Operation::Error(_) => Ok(Vec::new()),
        }
    }

    /// Whether a REST snapshot at `nonce` connects to the buffered deltas
    pub fn snapshot_bridges(&self, topic: &str, nonce: u64) -> bool {
        match self.topics.get(topic) {
            Some(TopicData::Book(book)) => book.snapshot_bridges(nonce),
            _ => true,
        }
    }

    /// Book is buffering deltas and has no snapshot yet
    pub fn awaiting_snapshot(&self, topic: &str) -> bool {
        matches!(
            self.topics.get(topic),
            Some(TopicData::Book(book)) if !book.is_synced() && book.pending_len() > 0
        )
    }

    pub fn get(&self, topic: &str) -> Option<&TopicData> {
        self.topics.get(topic)
    }

    /// Drop all state of a topic
    pub fn remove(&mut self, topic: &str) {
        if self.topics.remove(topic).is_some() {
            debug!(topic, "Topic state dropped");
        }
    }

    /// Drop every order book, keeping event caches
    ///
    /// Returns the topics whose books were dropped.
    pub fn clear_books(&mut self) -> Vec<String> {
        let mut cleared = Vec::new();
        self.topics.retain(|topic, data| {
            let book = matches!(data, TopicData::Book(_));
            if book {
                cleared.push(topic.clone());
            }
            !book
        });
        cleared
    }

    fn book_mut(&mut self, topic: &str) -> Result<&mut OrderBook> {
        let venue = &self.venue;
        let data = self.topics.entry(topic.to_string()).or_insert_with(|| {
            TopicData::Book(OrderBook::new(
                venue.nonce_policy_for(topic),
                venue.pending_delta_limit,
            ))
        });
        match data {
            TopicData::Book(book) => Ok(book),
            other => Err(SyncError::Protocol(format!(
                "book operation on {} topic {}",
                other.kind(),
                topic
            ))),
        }
    }

    fn append(&mut self, topic: &str, records: Vec<Record>) -> Result<Vec<Resolution>> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };

        let venue = &self.venue;
        let fresh_only = venue.new_updates;
        let data = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| match first {
                Record::Trade(_) => TopicData::Trades(ArrayCache::new(venue.trades_limit)),
                Record::Candle(_) => TopicData::Candles(TimestampCache::new(venue.ohlcv_limit)),
                Record::Order(_) => TopicData::Orders(SymbolIdCache::new(venue.orders_limit)),
            });

        let mismatch = |kind: &str| {
            SyncError::Protocol(format!("record does not match {} topic {}", kind, topic))
        };

        match data {
            TopicData::Trades(cache) => {
                for record in records {
                    match record {
                        Record::Trade(trade) => cache.append(trade),
                        _ => return Err(mismatch("trades")),
                    }
                }
                let trades = if fresh_only { cache.new_updates() } else { cache.limit() };
                Ok(vec![(topic.to_string(), TopicValue::Trades(trades))])
            }
            TopicData::Candles(cache) => {
                for record in records {
                    match record {
                        Record::Candle(candle) => cache.append(candle),
                        _ => return Err(mismatch("candles")),
                    }
                }
                let candles = if fresh_only { cache.new_updates() } else { cache.limit() };
                Ok(vec![(topic.to_string(), TopicValue::Candles(candles))])
            }
            TopicData::Orders(cache) => {
                let mut symbols = BTreeSet::new();
                for record in records {
                    match record {
                        Record::Order(order) => {
                            symbols.insert(order.symbol.clone());
                            cache.append(order);
                        }
                        _ => return Err(mismatch("orders")),
                    }
                }
                let fresh = fresh_only.then(|| cache.new_updates());
                let all = fresh.clone().unwrap_or_else(|| cache.limit());
                let mut resolutions = vec![(topic.to_string(), TopicValue::Orders(all))];
                if is_symbol_scoped(topic) {
                    return Ok(resolutions);
                }
                for symbol in symbols {
                    let orders = match &fresh {
                        Some(fresh) => fresh.iter().filter(|o| o.symbol == symbol).cloned().collect(),
                        None => cache.for_symbol(&symbol),
                    };
                    resolutions.push((format!("{}:{}", topic, symbol), TopicValue::Orders(orders)));
                }
                Ok(resolutions)
            }
            TopicData::Book(_) => Err(mismatch("orderbook")),
        }
    }
}

/// `orders:BTC/USD` is already per symbol; `orders` is the account-wide stream
pub fn is_symbol_scoped(topic: &str) -> bool {
    topic.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DesyncReason;
    use crate::message::{OrderStatus, TradeSide};
    use crate::orderbook::{BookDelta, BookSnapshot, ChecksumLayout, Level};
    use rust_decimal_macros::dec;

    const BOOK: &str = "orderbook:BTC/USD";

    fn store() -> TopicStore {
        TopicStore::new(Arc::new(VenueConfig::default()))
    }

    fn snapshot(nonce: u64) -> BookSnapshot {
        BookSnapshot {
            bids: vec![Level::new(dec!(100), dec!(1))],
            asks: vec![Level::new(dec!(101), dec!(2))],
            nonce,
            timestamp: None,
        }
    }

    fn delta(nonce: u64) -> BookDelta {
        BookDelta {
            bids: vec![Level::new(dec!(100), dec!(0))],
            asks: vec![Level::new(dec!(101.5), dec!(1))],
            nonce,
            ..Default::default()
        }
    }

    fn order(id: &str, symbol: &str, filled: rust_decimal::Decimal) -> Order {
        Order {
            id: id.to_string(),
            symbol: symbol.to_string(),
            timestamp: 1,
            side: TradeSide::Buy,
            price: Some(dec!(100)),
            amount: dec!(1),
            filled,
            status: OrderStatus::Open,
        }
    }

    fn book_view(resolutions: &[Resolution]) -> &crate::orderbook::BookView {
        match &resolutions[0].1 {
            TopicValue::OrderBook(view) => view,
            other => panic!("Expected order book, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_then_delta() {
        let mut store = store();
        let out = store.apply(BOOK, Operation::Snapshot(snapshot(5))).unwrap();
        assert_eq!(book_view(&out).nonce, Some(5));

        let out = store.apply(BOOK, Operation::Delta(delta(6))).unwrap();
        let view = book_view(&out);
        assert!(view.bids.is_empty());
        assert_eq!(
            view.asks,
            vec![Level::new(dec!(101), dec!(2)), Level::new(dec!(101.5), dec!(1))]
        );
        assert_eq!(view.nonce, Some(6));
    }

    #[test]
    fn test_buffered_delta_is_not_published() {
        let mut store = store();
        let out = store.apply(BOOK, Operation::Delta(delta(6))).unwrap();
        assert!(out.is_empty());
        assert!(store.awaiting_snapshot(BOOK));
        assert!(store.snapshot_bridges(BOOK, 5));
        assert!(!store.snapshot_bridges(BOOK, 3));
    }

    #[test]
    fn test_checksum_verified_against_book() {
        let mut store = store();
        store.apply(BOOK, Operation::Snapshot(snapshot(5))).unwrap();

        let snap = snapshot(5);
        let expected = ChecksumLayout::Interleaved.compute(&snap.bids, &snap.asks, 25);
        assert!(store.apply(BOOK, Operation::Checksum(expected)).unwrap().is_empty());

        let err = store.apply(BOOK, Operation::Checksum(expected ^ 1)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Desync(DesyncReason::ChecksumMismatch { .. })
        ));
        match store.get(BOOK) {
            Some(TopicData::Book(book)) => assert!(!book.is_synced()),
            other => panic!("Expected book, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_ignored_when_disabled() {
        let mut venue = VenueConfig::default();
        venue.checksum.enabled = false;
        let mut store = TopicStore::new(Arc::new(venue));
        store.apply(BOOK, Operation::Snapshot(snapshot(5))).unwrap();
        assert!(store.apply(BOOK, Operation::Checksum(0)).is_ok());
    }

    #[test]
    fn test_gap_reports_desync() {
        let mut store = store();
        store.apply(BOOK, Operation::Snapshot(snapshot(5))).unwrap();
        let err = store.apply(BOOK, Operation::Delta(delta(8))).unwrap_err();
        assert_eq!(
            err,
            SyncError::Desync(DesyncReason::SequenceGap { expected: 6, got: 8 })
        );
    }

    #[test]
    fn test_trades_are_bounded() {
        let venue = VenueConfig {
            trades_limit: 2,
            ..Default::default()
        };
        let mut store = TopicStore::new(Arc::new(venue));
        let trades: Vec<Record> = (0..3)
            .map(|i| {
                Record::Trade(Trade {
                    id: i.to_string(),
                    symbol: "BTC/USD".to_string(),
                    timestamp: i,
                    price: dec!(100),
                    amount: dec!(1),
                    side: TradeSide::Buy,
                })
            })
            .collect();

        let out = store.apply("trades:BTC/USD", Operation::Append(trades)).unwrap();
        match &out[0].1 {
            TopicValue::Trades(trades) => {
                let ids: Vec<&str> = trades.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["1", "2"]);
            }
            other => panic!("Expected trades, got {other:?}"),
        }
    }

    #[test]
    fn test_orders_fan_out_per_symbol() {
        let mut store = store();
        let out = store
            .apply(
                "orders",
                Operation::Append(vec![
                    Record::Order(order("1", "BTC/USD", dec!(0))),
                    Record::Order(order("2", "ETH/USD", dec!(0))),
                    Record::Order(order("1", "BTC/USD", dec!(0.5))),
                ]),
            )
            .unwrap();

        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["orders", "orders:BTC/USD", "orders:ETH/USD"]);
        match &out[1].1 {
            TopicValue::Orders(orders) => {
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].filled, dec!(0.5));
            }
            other => panic!("Expected orders, got {other:?}"),
        }
    }

    #[test]
    fn test_symbol_scoped_orders_are_not_fanned_out_again() {
        let mut store = store();
        let out = store
            .apply(
                "orders:BTC/USD",
                Operation::Append(vec![Record::Order(order("1", "BTC/USD", dec!(0)))]),
            )
            .unwrap();
        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["orders:BTC/USD"]);
    }

    #[test]
    fn test_new_updates_publish_only_fresh_records() {
        let venue = VenueConfig {
            new_updates: true,
            ..Default::default()
        };
        let mut store = TopicStore::new(Arc::new(venue));
        store
            .apply(
                "orders",
                Operation::Append(vec![
                    Record::Order(order("1", "BTC/USD", dec!(0))),
                    Record::Order(order("2", "ETH/USD", dec!(0))),
                ]),
            )
            .unwrap();

        let out = store
            .apply(
                "orders",
                Operation::Append(vec![Record::Order(order("1", "BTC/USD", dec!(1)))]),
            )
            .unwrap();
        let keys: Vec<&str> = out.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["orders", "orders:BTC/USD"]);
        for (_, value) in &out {
            assert_eq!(value, &TopicValue::Orders(vec![order("1", "BTC/USD", dec!(1))]));
        }
        match store.get("orders") {
            Some(TopicData::Orders(cache)) => assert_eq!(cache.len(), 2),
            other => panic!("Expected orders, got {other:?}"),
        }
    }

    #[test]
    fn test_record_kind_mismatch_is_protocol_error() {
        let mut store = store();
        store.apply(BOOK, Operation::Snapshot(snapshot(1))).unwrap();
        let err = store
            .apply(BOOK, Operation::Append(vec![Record::Order(order("1", "X", dec!(0)))]))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_clear_books_keeps_caches() {
        let mut store = store();
        store.apply(BOOK, Operation::Snapshot(snapshot(1))).unwrap();
        store
            .apply("orders", Operation::Append(vec![Record::Order(order("1", "X", dec!(0)))]))
            .unwrap();

        assert_eq!(store.clear_books(), vec![BOOK.to_string()]);
        assert!(store.get(BOOK).is_none());
        assert!(store.get("orders").is_some());
    }
}
