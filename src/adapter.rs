//! Boundary with per-venue adapters
//!
//! An adapter turns venue frames into [`Decoded`] operations and builds the
//! outbound frames the core sends on its behalf. Everything venue-specific
//! stays behind this trait.

use reqwest::Url;
use serde_json::Value;

use crate::error::Result;
use crate::message::Decoded;

#[cfg_attr(test, mockall::automock)]
pub trait Adapter: Send + Sync {
    /// Decode one inbound text frame; an error drops the frame only
    fn decode(&self, frame: &str) -> Result<Vec<Decoded>>;

    /// Build the subscribe frame for a topic
    fn subscribe_request(&self, topic: &str, params: &Value) -> String;

    /// Frame that cancels a subscription, when the venue has one
    fn unsubscribe_request(&self, _topic: &str) -> Option<String> {
        None
    }

    /// Application-level ping; `None` uses a WebSocket ping frame
    fn ping_request(&self) -> Option<String> {
        None
    }

    /// Private topics are rejected together when authentication fails
    fn is_private(&self, _topic: &str) -> bool {
        false
    }

    /// REST location of a book snapshot, for venues that do not push one
    fn snapshot_url(&self, _topic: &str) -> Option<Url> {
        None
    }
}
