//! Configuration module for the synchronization core
//!
//! [`VenueConfig`] is immutable once a manager is built and is shared by every
//! connection to that venue. [`Config`] adds the service-level settings used
//! by the binary.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::orderbook::{ChecksumLayout, NoncePolicy};
use crate::parser::channel_of;

/// Checksum verification settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    pub enabled: bool,
    pub layout: ChecksumLayout,
    /// Levels per side included in the checksum payload
    pub depth: usize,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            layout: ChecksumLayout::default(),
            depth: 25,
        }
    }
}

/// Per-venue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    /// WebSocket endpoint
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots, when the venue does not push them
    pub rest_endpoint: Option<String>,

    /// Keepalive settings
    pub keepalive_interval_ms: u64,
    pub pong_timeout_ms: u64,

    /// Reconnection settings (0 attempts = retry forever)
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Outbound frames queued while the socket is busy
    pub outbound_buffer: usize,

    /// Default delta sequencing, overridable per channel
    pub nonce_policy: NoncePolicy,
    pub nonce_policy_overrides: HashMap<String, NoncePolicy>,

    pub checksum: ChecksumConfig,

    /// Deltas held while a book waits for its snapshot
    pub pending_delta_limit: usize,

    /// Cache capacities
    pub trades_limit: usize,
    pub ohlcv_limit: usize,
    pub orders_limit: usize,

    /// Publish only the records written since a consumer's previous update
    /// instead of the whole cache
    pub new_updates: bool,

    /// Levels per side handed to consumers; `None` hands out the full book
    pub book_depth: Option<usize>,

    /// Resend the subscribe frame automatically after a desync
    pub resubscribe_on_desync: bool,

    /// Attempts at a REST snapshot that bridges the buffered deltas
    pub snapshot_max_retries: u32,

    /// Channels that need an authenticated connection
    pub private_channels: Vec<String>,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            rest_endpoint: None,
            keepalive_interval_ms: 20_000,
            pong_timeout_ms: 30_000,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            outbound_buffer: 256,
            nonce_policy: NoncePolicy::Strict,
            nonce_policy_overrides: HashMap::new(),
            checksum: ChecksumConfig::default(),
            pending_delta_limit: 1000,
            trades_limit: 1000,
            ohlcv_limit: 1000,
            orders_limit: 1000,
            new_updates: false,
            book_depth: None,
            resubscribe_on_desync: true,
            snapshot_max_retries: 3,
            private_channels: Vec::new(),
        }
    }
}

impl VenueConfig {
    /// Nonce policy for a topic, looked up by its channel
    pub fn nonce_policy_for(&self, topic: &str) -> NoncePolicy {
        self.nonce_policy_overrides
            .get(channel_of(topic))
            .copied()
            .unwrap_or(self.nonce_policy)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ws_endpoint.is_empty() {
            return Err(SyncError::Config("ws_endpoint must be set".to_string()));
        }
        if self.trades_limit == 0 || self.ohlcv_limit == 0 || self.orders_limit == 0 {
            return Err(SyncError::Config(
                "cache capacities must be positive".to_string(),
            ));
        }
        if self.pending_delta_limit == 0 || self.outbound_buffer == 0 {
            return Err(SyncError::Config(
                "pending_delta_limit and outbound_buffer must be positive".to_string(),
            ));
        }
        if self.checksum.enabled && self.checksum.depth == 0 {
            return Err(SyncError::Config(
                "checksum depth must be positive".to_string(),
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(SyncError::Config(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.pong_timeout_ms < self.keepalive_interval_ms {
            return Err(SyncError::Config(format!(
                "pong_timeout_ms ({}) shorter than keepalive_interval_ms ({})",
                self.pong_timeout_ms, self.keepalive_interval_ms
            )));
        }
        Ok(())
    }
}

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub venue: VenueConfig,

    /// Topics watched at startup (e.g., ["orderbook:BTC/USD", "trades:BTC/USD"])
    pub topics: Vec<String>,

    /// Port of the health and metrics server
    pub health_port: u16,

    /// Status log interval in seconds
    pub health_check_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            venue: VenueConfig::default(),
            topics: vec!["orderbook:BTC/USD".to_string()],
            health_port: 9090,
            health_check_interval_secs: 30,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();
        let venue_defaults = defaults.venue;

        let checksum = ChecksumConfig {
            enabled: env_or("CHECKSUM_ENABLED", venue_defaults.checksum.enabled),
            layout: match env::var("CHECKSUM_LAYOUT").as_deref() {
                Ok("asks_then_bids") => ChecksumLayout::AsksThenBids,
                Ok("interleaved") | Err(_) => ChecksumLayout::Interleaved,
                Ok(other) => {
                    return Err(SyncError::Config(format!(
                        "unknown CHECKSUM_LAYOUT: {}",
                        other
                    )))
                }
            },
            depth: env_or("CHECKSUM_DEPTH", venue_defaults.checksum.depth),
        };

        let nonce_policy = match env::var("NONCE_POLICY").as_deref() {
            Ok("monotonic") => NoncePolicy::Monotonic,
            Ok("unchecked") => NoncePolicy::Unchecked,
            Ok("strict") | Err(_) => NoncePolicy::Strict,
            Ok(other) => {
                return Err(SyncError::Config(format!(
                    "unknown NONCE_POLICY: {}",
                    other
                )))
            }
        };

        let venue = VenueConfig {
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(venue_defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").ok(),
            keepalive_interval_ms: env_or(
                "KEEPALIVE_INTERVAL_MS",
                venue_defaults.keepalive_interval_ms,
            ),
            pong_timeout_ms: env_or("PONG_TIMEOUT_MS", venue_defaults.pong_timeout_ms),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", venue_defaults.reconnect_delay_ms),
            max_reconnect_attempts: env_or(
                "MAX_RECONNECT_ATTEMPTS",
                venue_defaults.max_reconnect_attempts,
            ),
            outbound_buffer: env_or("OUTBOUND_BUFFER", venue_defaults.outbound_buffer),
            nonce_policy,
            nonce_policy_overrides: HashMap::new(),
            checksum,
            pending_delta_limit: env_or("PENDING_DELTA_LIMIT", venue_defaults.pending_delta_limit),
            trades_limit: env_or("TRADES_LIMIT", venue_defaults.trades_limit),
            ohlcv_limit: env_or("OHLCV_LIMIT", venue_defaults.ohlcv_limit),
            orders_limit: env_or("ORDERS_LIMIT", venue_defaults.orders_limit),
            new_updates: env_or("NEW_UPDATES", venue_defaults.new_updates),
            book_depth: env::var("BOOK_DEPTH").ok().and_then(|v| v.parse().ok()),
            resubscribe_on_desync: env_or(
                "RESUBSCRIBE_ON_DESYNC",
                venue_defaults.resubscribe_on_desync,
            ),
            snapshot_max_retries: env_or(
                "SNAPSHOT_MAX_RETRIES",
                venue_defaults.snapshot_max_retries,
            ),
            private_channels: env_list("PRIVATE_CHANNELS").unwrap_or_default(),
        };

        let config = Self {
            venue,
            topics: env_list("TOPICS").unwrap_or(defaults.topics),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
            health_check_interval_secs: env_or(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `SYNC__*` environment overrides
    ///
    /// Nested keys use a double underscore: `SYNC__VENUE__WS_ENDPOINT`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("SYNC").separator("__"))
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_secs == 0 {
            return Err(SyncError::Config(
                "health_check_interval_secs must be positive".to_string(),
            ));
        }
        self.venue.validate()
    }
}
