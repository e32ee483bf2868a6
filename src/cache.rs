//! Bounded event caches
//!
//! Fixed-capacity, append-ordered containers. Overflow silently evicts the
//! oldest record; no operation fails because a cache is full.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// Records that carry a timestamp used for in-place updates
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// Records identified by symbol and id
pub trait SymbolKeyed {
    fn symbol(&self) -> &str;
    fn id(&self) -> &str;
}

/// Common contract of all cache variants
pub trait BoundedCache<T> {
    /// Insert a record according to the variant's rule
    fn append(&mut self, record: T);

    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` most recent records, oldest first
    fn most_recent(&self, n: usize) -> Vec<T>;

    /// All records, oldest first
    fn limit(&self) -> Vec<T> {
        self.most_recent(self.len())
    }

    /// Records written since the previous call, oldest first
    ///
    /// A record updated in place counts as written. Evicted records are
    /// never returned.
    fn new_updates(&mut self) -> Vec<T>;
}

fn tail<T: Clone>(records: &VecDeque<T>, n: usize) -> Vec<T> {
    let skip = records.len().saturating_sub(n);
    records.iter().skip(skip).cloned().collect()
}

/// Append-only cache
#[derive(Debug, Clone)]
pub struct ArrayCache<T> {
    records: VecDeque<T>,
    capacity: usize,
    /// Number of tail records not yet returned by `new_updates`
    fresh: usize,
}

impl<T> ArrayCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            fresh: 0,
        }
    }
}

impl<T: Clone> BoundedCache<T> for ArrayCache<T> {
    fn append(&mut self, record: T) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.fresh = (self.fresh + 1).min(self.records.len());
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn most_recent(&self, n: usize) -> Vec<T> {
        tail(&self.records, n)
    }

    fn new_updates(&mut self) -> Vec<T> {
        tail(&self.records, std::mem::take(&mut self.fresh))
    }
}

/// Cache whose tail is updated in place when the timestamp repeats
///
/// Used for candles: the venue keeps re-sending the current candle until it closes.
#[derive(Debug, Clone)]
pub struct TimestampCache<T> {
    records: VecDeque<T>,
    capacity: usize,
    fresh: usize,
}

impl<T> TimestampCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            fresh: 0,
        }
    }
}

impl<T: Clone + Timestamped> BoundedCache<T> for TimestampCache<T> {
    fn append(&mut self, record: T) {
        if let Some(last) = self.records.back_mut() {
            if last.timestamp() == record.timestamp() {
                *last = record;
                self.fresh = self.fresh.max(1);
                return;
            }
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.fresh = (self.fresh + 1).min(self.records.len());
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn most_recent(&self, n: usize) -> Vec<T> {
        tail(&self.records, n)
    }

    fn new_updates(&mut self) -> Vec<T> {
        tail(&self.records, std::mem::take(&mut self.fresh))
    }
}

/// Upsert cache keyed by (symbol, id) with a per-symbol index
///
/// Entries carry a monotonically increasing sequence number; an entry's
/// position is `seq - head_seq`, so eviction never rewrites the index.
#[derive(Debug, Clone)]
pub struct SymbolIdCache<T> {
    records: VecDeque<T>,
    capacity: usize,
    /// Sequence number of `records[0]`
    head_seq: u64,
    /// symbol -> id -> sequence number
    by_symbol: HashMap<String, HashMap<String, u64>>,
    /// Sequence numbers written since the last `new_updates`
    fresh: BTreeSet<u64>,
}

impl<T> SymbolIdCache<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            head_seq: 0,
            by_symbol: HashMap::new(),
            fresh: BTreeSet::new(),
        }
    }
}

impl<T: Clone + SymbolKeyed> SymbolIdCache<T> {
    /// Position of the record with this key, if cached
    pub fn position(&self, symbol: &str, id: &str) -> Option<usize> {
        self.by_symbol
            .get(symbol)
            .and_then(|ids| ids.get(id))
            .map(|seq| (seq - self.head_seq) as usize)
    }

    pub fn get(&self, symbol: &str, id: &str) -> Option<&T> {
        self.position(symbol, id).and_then(|pos| self.records.get(pos))
    }

    /// Records of one symbol in cache order
    pub fn for_symbol(&self, symbol: &str) -> Vec<T> {
        let Some(ids) = self.by_symbol.get(symbol) else {
            return Vec::new();
        };
        let mut seqs: Vec<u64> = ids.values().copied().collect();
        seqs.sort_unstable();
        seqs.into_iter()
            .filter_map(|seq| self.records.get((seq - self.head_seq) as usize))
            .cloned()
            .collect()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.by_symbol.keys().map(String::as_str)
    }

    fn evict_front(&mut self) {
        let Some(evicted) = self.records.pop_front() else {
            return;
        };
        let seq = self.head_seq;
        self.head_seq += 1;
        self.fresh.remove(&seq);
        if let Some(ids) = self.by_symbol.get_mut(evicted.symbol()) {
            if ids.get(evicted.id()) == Some(&seq) {
                ids.remove(evicted.id());
            }
            if ids.is_empty() {
                self.by_symbol.remove(evicted.symbol());
            }
        }
    }
}

impl<T: Clone + SymbolKeyed> BoundedCache<T> for SymbolIdCache<T> {
    fn append(&mut self, record: T) {
        if let Some(pos) = self.position(record.symbol(), record.id()) {
            self.records[pos] = record;
            self.fresh.insert(self.head_seq + pos as u64);
            return;
        }
        if self.records.len() == self.capacity {
            self.evict_front();
        }
        let seq = self.head_seq + self.records.len() as u64;
        self.by_symbol
            .entry(record.symbol().to_string())
            .or_default()
            .insert(record.id().to_string(), seq);
        self.records.push_back(record);
        self.fresh.insert(seq);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn most_recent(&self, n: usize) -> Vec<T> {
        tail(&self.records, n)
    }

    fn new_updates(&mut self) -> Vec<T> {
        std::mem::take(&mut self.fresh)
            .into_iter()
            .filter_map(|seq| self.records.get((seq - self.head_seq) as usize))
            .cloned()
            .collect()
    }
}
