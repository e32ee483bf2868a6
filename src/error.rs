//! Error types for the synchronization core

use thiserror::Error;

/// Why an order book can no longer be trusted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DesyncReason {
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("stale nonce: last applied {last}, got {got}")]
    StaleNonce { last: u64, got: u64 },

    #[error("checksum mismatch: venue sent {expected}, computed {computed}")]
    ChecksumMismatch { expected: i64, computed: i64 },
}

impl DesyncReason {
    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            DesyncReason::SequenceGap { .. } => "sequence_gap",
            DesyncReason::StaleNonce { .. } => "stale_nonce",
            DesyncReason::ChecksumMismatch { .. } => "checksum",
        }
    }
}

/// Synchronization errors
///
/// `Clone` because one rejection is delivered to every waiter of a topic.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Order book desync: {0}")]
    Desync(DesyncReason),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Topic closed: {0}")]
    TopicClosed(String),

    #[error("Venue error: {0}")]
    Venue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl SyncError {
    /// Fatal errors also remove long-lived waiters
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_)
                | SyncError::TopicClosed(_)
                | SyncError::MaxReconnectAttemptsExceeded
        )
    }
}

impl From<DesyncReason> for SyncError {
    fn from(reason: DesyncReason) -> Self {
        SyncError::Desync(reason)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::RestApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::Authentication("bad key".into()).is_fatal());
        assert!(SyncError::TopicClosed("trades:BTC/USD".into()).is_fatal());
        assert!(!SyncError::Transport("reset".into()).is_fatal());
        assert!(!SyncError::Capacity("outbound queue".into()).is_fatal());
        assert!(!SyncError::Desync(DesyncReason::StaleNonce { last: 5, got: 5 }).is_fatal());
    }

    #[test]
    fn test_desync_display() {
        let err: SyncError = DesyncReason::SequenceGap { expected: 7, got: 9 }.into();
        assert_eq!(
            err.to_string(),
            "Order book desync: sequence gap: expected 7, got 9"
        );
    }
}
