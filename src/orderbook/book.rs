//! Core order book reconciler
//!
//! Uses BTreeMap for sorted price level management. Deltas that arrive before
//! the first snapshot are buffered and replayed once it lands.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use super::{BookDelta, BookSnapshot, BookView, ChecksumLayout, Level, NoncePolicy, Side};
use crate::error::{DesyncReason, Result};

/// What happened to a delta handed to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Merged into the book
    Applied,
    /// Held until a snapshot arrives
    Buffered,
}

/// Order book for a single topic
#[derive(Debug)]
pub struct OrderBook {
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Nonce of the last applied snapshot or delta
    nonce: Option<u64>,
    /// Timestamp of last update
    timestamp: Option<i64>,
    /// Deltas received before the snapshot
    pending: VecDeque<BookDelta>,
    pending_limit: usize,
    policy: NoncePolicy,
}

impl OrderBook {
    /// Create a new empty order book awaiting its snapshot
    pub fn new(policy: NoncePolicy, pending_limit: usize) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            nonce: None,
            timestamp: None,
            pending: VecDeque::new(),
            pending_limit,
            policy,
        }
    }

    /// Replace both sides and replay buffered deltas newer than the snapshot
    pub fn apply_snapshot(&mut self, snapshot: BookSnapshot) -> Result<()> {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.amount > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.amount);
            }
        }

        for level in &snapshot.asks {
            if level.amount > Decimal::ZERO {
                self.asks.insert(level.price, level.amount);
            }
        }

        self.nonce = Some(snapshot.nonce);
        self.timestamp = snapshot.timestamp;

        let mut buffered: Vec<BookDelta> = self.pending.drain(..).collect();
        buffered.retain(|delta| delta.nonce > snapshot.nonce);
        buffered.sort_by_key(|delta| delta.nonce);

        if !buffered.is_empty() {
            debug!(
                snapshot_nonce = snapshot.nonce,
                replayed = buffered.len(),
                "Replaying buffered deltas"
            );
        }

        for delta in buffered {
            self.apply_delta(delta)?;
        }

        Ok(())
    }

    /// Apply a delta, or buffer it while no snapshot is present
    ///
    /// A sequence violation discards the book and returns a desync error; later
    /// deltas are buffered until the next snapshot.
    pub fn apply_delta(&mut self, delta: BookDelta) -> Result<DeltaOutcome> {
        let Some(last) = self.nonce else {
            self.buffer(delta);
            return Ok(DeltaOutcome::Buffered);
        };

        if let Err(reason) = self.check_sequence(last, &delta) {
            self.reset();
            return Err(reason.into());
        }

        for level in &delta.bids {
            self.update_side(Side::Bid, level);
        }

        for level in &delta.asks {
            self.update_side(Side::Ask, level);
        }

        self.nonce = Some(delta.nonce);
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }

        Ok(DeltaOutcome::Applied)
    }

    /// Compare the venue checksum with one computed over the local book
    ///
    /// A mismatch is handled like a sequence gap: the book is discarded.
    pub fn verify_checksum(
        &mut self,
        expected: i64,
        layout: ChecksumLayout,
        depth: usize,
    ) -> Result<()> {
        let computed = self.checksum(layout, depth);
        if computed != expected {
            self.reset();
            return Err(DesyncReason::ChecksumMismatch { expected, computed }.into());
        }
        Ok(())
    }

    /// Checksum of the top `depth` levels in the given layout
    pub fn checksum(&self, layout: ChecksumLayout, depth: usize) -> i64 {
        let view = self.depth_limited(Some(depth));
        layout.compute(&view.bids, &view.asks, depth)
    }

    /// Top `depth` levels per side, or the whole book for `None`
    pub fn depth_limited(&self, depth: Option<usize>) -> BookView {
        let depth = depth.unwrap_or(usize::MAX);
        BookView {
            bids: self
                .bids
                .iter()
                .take(depth)
                .map(|(Reverse(p), a)| Level::new(*p, *a))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, a)| Level::new(*p, *a))
                .collect(),
            nonce: self.nonce,
            timestamp: self.timestamp,
        }
    }

    /// Discard all state; the book waits for a fresh snapshot
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.pending.clear();
        self.nonce = None;
        self.timestamp = None;
    }

    /// Whether a snapshot has been applied since the last reset
    pub fn is_synced(&self) -> bool {
        self.nonce.is_some()
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    /// Lowest nonce among buffered deltas
    pub fn oldest_pending_nonce(&self) -> Option<u64> {
        self.pending.iter().map(|delta| delta.nonce).min()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a snapshot at `nonce` can be bridged to the buffered deltas
    pub fn snapshot_bridges(&self, nonce: u64) -> bool {
        match (self.policy, self.oldest_pending_nonce()) {
            (NoncePolicy::Strict, Some(oldest)) => oldest <= nonce.saturating_add(1),
            _ => true,
        }
    }

    fn check_sequence(&self, last: u64, delta: &BookDelta) -> std::result::Result<(), DesyncReason> {
        match self.policy {
            NoncePolicy::Strict => match delta.prev_nonce {
                Some(prev) if prev != last => Err(DesyncReason::SequenceGap {
                    expected: last,
                    got: prev,
                }),
                Some(_) => Ok(()),
                None => match last.checked_add(1) {
                    Some(next) if next == delta.nonce => Ok(()),
                    next => Err(DesyncReason::SequenceGap {
                        expected: next.unwrap_or(last),
                        got: delta.nonce,
                    }),
                },
            },
            NoncePolicy::Monotonic if delta.nonce <= last => Err(DesyncReason::StaleNonce {
                last,
                got: delta.nonce,
            }),
            NoncePolicy::Monotonic | NoncePolicy::Unchecked => Ok(()),
        }
    }

    fn buffer(&mut self, delta: BookDelta) {
        if self.pending.len() >= self.pending_limit {
            // Overflow evicts the oldest delta; a resulting gap surfaces on replay
            warn!(
                limit = self.pending_limit,
                "Pending delta buffer full, evicting oldest"
            );
            self.pending.pop_front();
        }
        self.pending.push_back(delta);
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &Level) {
        match side {
            Side::Bid => {
                if level.amount == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.amount);
                }
            }
            Side::Ask => {
                if level.amount == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.amount);
                }
            }
        }
    }
}
