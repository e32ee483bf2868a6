//! Market Sync - streaming market-data synchronization core
//!
//! Multiplexes logical topic subscriptions over shared WebSocket connections,
//! keeps bounded caches of recent events, and reconciles order book deltas
//! into gap-free, checksum-verified books across reconnects.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod orderbook;
pub mod parser;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod websocket;

pub use adapter::Adapter;
pub use cache::{ArrayCache, BoundedCache, SymbolIdCache, TimestampCache};
pub use config::{ChecksumConfig, Config, VenueConfig};
pub use error::{DesyncReason, Result, SyncError};
pub use message::{Candle, Decoded, Operation, Order, Record, Trade};
pub use metrics::SyncMetrics;
pub use orderbook::{BookDelta, BookSnapshot, BookView, ChecksumLayout, Level, NoncePolicy, OrderBook};
pub use parser::JsonAdapter;
pub use router::{Router, TopicState, TopicUpdate, TopicValue, WaitMode};
pub use websocket::{ConnectionManager, Subscription};
