//! WebSocket connection manager
//!
//! Owns one connection per endpoint and routes consumer requests to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::info;

use super::connection::{Connection, ConnectionStatus, Subscription};
use crate::adapter::Adapter;
use crate::config::VenueConfig;
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::router::{TopicState, TopicUpdate, WaitMode};

type Slot = Arc<OnceCell<Arc<Connection>>>;

/// Status of one topic on one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TopicStatus {
    pub url: String,
    pub topic: String,
    pub state: TopicState,
    pub version: Option<u64>,
}

/// Manages connections for one venue
pub struct ConnectionManager {
    venue: Arc<VenueConfig>,
    adapter: Arc<dyn Adapter>,
    metrics: SyncMetrics,
    connections: Mutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(venue: VenueConfig, adapter: Arc<dyn Adapter>, metrics: SyncMetrics) -> Result<Self> {
        venue.validate()?;
        Ok(Self {
            venue: Arc::new(venue),
            adapter,
            metrics,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn venue(&self) -> &VenueConfig {
        &self.venue
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live connection for `url`, connecting if needed
    ///
    /// Concurrent callers for the same URL share one connection attempt.
    pub async fn ensure_connection(&self, url: &str) -> Result<Arc<Connection>> {
        let slot = {
            let mut connections = self.lock();
            let slot = connections
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            let closed = slot
                .get()
                .map(|conn| conn.status() == ConnectionStatus::Closed)
                .unwrap_or(false);
            if closed {
                *slot = Arc::new(OnceCell::new());
            }
            slot.clone()
        };

        let connection = slot
            .get_or_try_init(|| {
                Connection::open(
                    url,
                    self.venue.clone(),
                    self.adapter.clone(),
                    self.metrics.clone(),
                )
            })
            .await?;
        Ok(connection.clone())
    }

    /// Take a reference on `topics` and send `request` if any of them is new
    pub async fn subscribe(
        &self,
        url: &str,
        topics: Vec<String>,
        request: Option<String>,
        mode: WaitMode,
    ) -> Result<Subscription> {
        let connection = self.ensure_connection(url).await?;
        connection.watch(topics, request, mode).await
    }

    /// Watch one topic with a caller-built subscribe frame
    pub async fn watch(
        &self,
        url: &str,
        topic: &str,
        request: Option<String>,
        mode: WaitMode,
    ) -> Result<Subscription> {
        self.subscribe(url, vec![topic.to_string()], request, mode)
            .await
    }

    /// Watch one topic, building the subscribe frame with the adapter
    pub async fn watch_topic(
        &self,
        url: &str,
        topic: &str,
        params: &Value,
        mode: WaitMode,
    ) -> Result<Subscription> {
        let request = self.adapter.subscribe_request(topic, params);
        self.watch(url, topic, Some(request), mode).await
    }

    /// Watch several topics behind one subscribe frame; resolves on any of them
    pub async fn watch_multiple(
        &self,
        url: &str,
        topics: &[String],
        request: Option<String>,
        mode: WaitMode,
    ) -> Result<Subscription> {
        self.subscribe(url, topics.to_vec(), request, mode).await
    }

    /// Unsubscribe a topic on every connection, cancelling its waiters
    pub fn unwatch(&self, topic: &str) -> bool {
        let mut found = false;
        for connection in self.connections() {
            found |= connection.unwatch(topic);
        }
        found
    }

    /// Write one frame to the connection for `url`
    pub async fn send(&self, url: &str, frame: String) -> Result<()> {
        let connection = self.existing(url).ok_or_else(|| {
            SyncError::Transport(format!("no connection to {}", url))
        })?;
        connection.send(frame).await
    }

    /// Authenticate the connection for `url`
    pub async fn authenticate(&self, url: &str, request: String, ack_topic: &str) -> Result<TopicUpdate> {
        let connection = self.ensure_connection(url).await?;
        connection.authenticate(request, ack_topic).await
    }

    /// State of a topic on the first connection that knows it
    pub fn topic_state(&self, topic: &str) -> TopicState {
        self.connections()
            .iter()
            .map(|connection| connection.router().state(topic))
            .find(|state| *state != TopicState::Unsubscribed)
            .unwrap_or_default()
    }

    /// Status of every subscribed topic
    pub fn statuses(&self) -> Vec<TopicStatus> {
        let mut statuses = Vec::new();
        for connection in self.connections() {
            for topic in connection.topics() {
                let router = connection.router();
                statuses.push(TopicStatus {
                    url: connection.url().to_string(),
                    state: router.state(&topic),
                    version: router.latest(&topic).map(|update| update.version),
                    topic,
                });
            }
        }
        statuses
    }

    /// Latest value of a topic, if any connection resolved it
    pub fn latest(&self, topic: &str) -> Option<TopicUpdate> {
        self.connections()
            .iter()
            .find_map(|connection| connection.router().latest(topic))
    }

    /// Shut down every connection
    pub fn close(&self) {
        let slots: Vec<Slot> = self.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(connection) = slot.get() {
                info!(url = %connection.url(), "Closing connection");
                connection.shutdown();
            }
        }
    }

    fn existing(&self, url: &str) -> Option<Arc<Connection>> {
        self.lock().get(url).and_then(|slot| slot.get().cloned())
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
