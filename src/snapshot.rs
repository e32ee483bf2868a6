//! REST order book snapshots
//!
//! Used for venues that stream deltas only; the first buffered delta of a
//! book triggers a fetch.

use reqwest::Url;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::orderbook::BookSnapshot;

/// Fetches book snapshots over HTTP
#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    client: reqwest::Client,
}

impl SnapshotLoader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    /// Fetch and decode one snapshot
    pub async fn fetch(&self, url: Url) -> Result<BookSnapshot> {
        info!(url = %url, "Fetching order book snapshot");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RestApi(format!(
                "snapshot request failed with status {}",
                status
            )));
        }

        let snapshot = response.json::<BookSnapshot>().await?;
        Ok(snapshot)
    }
}
