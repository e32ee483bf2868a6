//! Normalized update operations produced by venue adapters

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cache::{SymbolKeyed, Timestamped};
use crate::orderbook::{BookDelta, BookSnapshot};

/// One decoded operation addressed to a topic
#[derive(Debug, Clone)]
pub struct Decoded {
    pub topic: String,
    pub op: Operation,
}

impl Decoded {
    pub fn new(topic: impl Into<String>, op: Operation) -> Self {
        Self {
            topic: topic.into(),
            op,
        }
    }
}

/// Everything an adapter can tell the core about a frame
#[derive(Debug, Clone)]
pub enum Operation {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    Append(Vec<Record>),
    /// Venue checksum over the topic's book after the preceding operations
    Checksum(i64),
    AuthAck,
    Pong,
    Error(VenueError),
}

/// Records kept in bounded caches
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Trade(Trade),
    Candle(Candle),
    Order(Order),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Public or private trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub timestamp: i64,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: TradeSide,
}

/// OHLCV candle, keyed by its open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Timestamped for Candle {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
}

/// Account order state as last reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub timestamp: i64,
    pub side: TradeSide,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub amount: Decimal,
    #[serde(default)]
    pub filled: Decimal,
    pub status: OrderStatus,
}

impl SymbolKeyed for Order {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueErrorKind {
    /// Credentials rejected; fatal for every private topic on the connection
    Auth,
    /// Subscribe request refused for one topic
    Subscription,
    Other,
}

/// Error reported by the venue inside a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueError {
    pub kind: VenueErrorKind,
    pub message: String,
}
