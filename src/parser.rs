//! Reference adapter for a normalized JSON wire format
//!
//! Each frame is one JSON object tagged by `type`:
//!
//! ```json
//! {"type":"snapshot","topic":"orderbook:BTC/USD","nonce":5,"bids":[["100","1"]],"asks":[["101","2"]]}
//! {"type":"delta","topic":"orderbook:BTC/USD","nonce":6,"bids":[["100","0"]],"asks":[],"checksum":-12345}
//! {"type":"trades","topic":"trades:BTC/USD","data":[{"id":"1","symbol":"BTC/USD",...}]}
//! {"type":"pong"}
//! ```
//!
//! Prices and amounts travel as decimal strings and never pass through floats.

use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::str::FromStr;

use crate::adapter::Adapter;
use crate::error::{Result, SyncError};
use crate::message::{Candle, Decoded, Operation, Order, Record, Trade, VenueError, VenueErrorKind};
use crate::orderbook::{BookDelta, BookSnapshot, Level};

/// Frames of the normalized wire format
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Snapshot {
        topic: String,
        #[serde(flatten)]
        book: BookSnapshot,
        #[serde(default)]
        checksum: Option<i64>,
    },
    Delta {
        topic: String,
        #[serde(default, deserialize_with = "deserialize_price_levels")]
        bids: Vec<Level>,
        #[serde(default, deserialize_with = "deserialize_price_levels")]
        asks: Vec<Level>,
        nonce: u64,
        #[serde(default)]
        prev_nonce: Option<u64>,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        checksum: Option<i64>,
    },
    Trades {
        topic: String,
        data: Vec<Trade>,
    },
    Candles {
        topic: String,
        data: Vec<Candle>,
    },
    Orders {
        topic: String,
        data: Vec<Order>,
    },
    AuthAck {
        topic: String,
    },
    Pong,
    Error {
        #[serde(default)]
        topic: Option<String>,
        kind: VenueErrorKind,
        message: String,
    },
}

/// Topic key used for frames that address the connection rather than a topic
pub const CONNECTION_TOPIC: &str = "";

/// Adapter for the normalized JSON format
#[derive(Debug, Clone, Default)]
pub struct JsonAdapter {
    rest_endpoint: Option<String>,
    private_channels: Vec<String>,
}

impl JsonAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch book snapshots from `{endpoint}/snapshot?topic=...`
    pub fn with_rest_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rest_endpoint = Some(endpoint.into());
        self
    }

    /// Channels (topic prefixes before the first `:`) that require authentication
    pub fn with_private_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.private_channels = channels.into_iter().map(Into::into).collect();
        self
    }
}

/// Channel part of a topic key (`"trades:BTC/USD"` -> `"trades"`)
pub fn channel_of(topic: &str) -> &str {
    topic.split(':').next().unwrap_or(topic)
}

impl Adapter for JsonAdapter {
    fn decode(&self, frame: &str) -> Result<Vec<Decoded>> {
        let message: WireMessage = serde_json::from_str(frame)?;

        let decoded = match message {
            WireMessage::Snapshot {
                topic,
                book,
                checksum,
            } => {
                let mut ops = vec![Decoded::new(topic.clone(), Operation::Snapshot(book))];
                if let Some(checksum) = checksum {
                    ops.push(Decoded::new(topic, Operation::Checksum(checksum)));
                }
                ops
            }
            WireMessage::Delta {
                topic,
                bids,
                asks,
                nonce,
                prev_nonce,
                timestamp,
                checksum,
            } => {
                let delta = BookDelta {
                    bids,
                    asks,
                    nonce,
                    prev_nonce,
                    timestamp,
                };
                let mut ops = vec![Decoded::new(topic.clone(), Operation::Delta(delta))];
                if let Some(checksum) = checksum {
                    ops.push(Decoded::new(topic, Operation::Checksum(checksum)));
                }
                ops
            }
            WireMessage::Trades { topic, data } => vec![Decoded::new(
                topic,
                Operation::Append(data.into_iter().map(Record::Trade).collect()),
            )],
            WireMessage::Candles { topic, data } => vec![Decoded::new(
                topic,
                Operation::Append(data.into_iter().map(Record::Candle).collect()),
            )],
            WireMessage::Orders { topic, data } => vec![Decoded::new(
                topic,
                Operation::Append(data.into_iter().map(Record::Order).collect()),
            )],
            WireMessage::AuthAck { topic } => vec![Decoded::new(topic, Operation::AuthAck)],
            WireMessage::Pong => vec![Decoded::new(CONNECTION_TOPIC, Operation::Pong)],
            WireMessage::Error {
                topic,
                kind,
                message,
            } => vec![Decoded::new(
                topic.unwrap_or_default(),
                Operation::Error(VenueError { kind, message }),
            )],
        };

        Ok(decoded)
    }

    fn subscribe_request(&self, topic: &str, params: &Value) -> String {
        json!({ "op": "subscribe", "topic": topic, "params": params }).to_string()
    }

    fn unsubscribe_request(&self, topic: &str) -> Option<String> {
        Some(json!({ "op": "unsubscribe", "topic": topic }).to_string())
    }

    fn ping_request(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn is_private(&self, topic: &str) -> bool {
        let channel = channel_of(topic);
        self.private_channels.iter().any(|c| c == channel)
    }

    fn snapshot_url(&self, topic: &str) -> Option<Url> {
        let endpoint = self.rest_endpoint.as_ref()?;
        Url::parse_with_params(
            &format!("{}/snapshot", endpoint.trim_end_matches('/')),
            &[("topic", topic)],
        )
        .ok()
    }
}

/// Custom deserializer for price levels from array of string pairs
pub(crate) fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<Level>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(Level {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                amount: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

impl From<VenueError> for SyncError {
    fn from(err: VenueError) -> Self {
        match err.kind {
            VenueErrorKind::Auth => SyncError::Authentication(err.message),
            VenueErrorKind::Subscription | VenueErrorKind::Other => SyncError::Venue(err.message),
        }
    }
}
