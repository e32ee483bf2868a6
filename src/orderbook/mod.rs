//! Order book module
//!
//! Reconciles snapshots and incremental deltas into a gap-free book.

mod book;
mod checksum;

pub use book::{DeltaOutcome, OrderBook};
pub use checksum::{crc32_signed, crc32_unsigned, ChecksumLayout};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::parser::deserialize_price_levels;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub amount: Decimal,
}

impl Level {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }
}

/// How a book validates the sequence numbers of incoming deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoncePolicy {
    /// Every delta must be exactly `previous + 1` (or carry `prev_nonce == previous`)
    #[default]
    Strict,
    /// Nonces must only increase; gaps are tolerated
    Monotonic,
    /// Nonces are ignored, integrity comes from checksums only
    Unchecked,
}

/// Full replacement of both sides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookSnapshot {
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<Level>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<Level>,

    pub nonce: u64,

    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Incremental change to one or both sides
///
/// An amount of zero removes the price level.
#[derive(Debug, Clone, Default)]
pub struct BookDelta {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub nonce: u64,
    /// Sequence number of the venue's previous update, when the venue sends one
    pub prev_nonce: Option<u64>,
    pub timestamp: Option<i64>,
}

/// Read-only, depth-limited copy of a book handed to consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookView {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub nonce: Option<u64>,
    pub timestamp: Option<i64>,
}

impl BookView {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }
}
