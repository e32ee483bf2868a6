//! Market Sync - service binary
//!
//! Watches the configured topics through the synchronization core, logs
//! top-of-book status, and serves health and metrics endpoints.

use std::sync::Arc;
use std::time::Duration;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::Value;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_sync::{
    Config, ConnectionManager, JsonAdapter, SyncMetrics, TopicValue, WaitMode,
};

/// Application state shared across components
struct AppState {
    manager: ConnectionManager,
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Sync");

    // Load configuration
    let config = match std::env::var("SYNC_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::load()?,
    };
    info!(
        endpoint = %config.venue.ws_endpoint,
        topics = ?config.topics,
        "Configuration loaded"
    );

    let mut adapter = JsonAdapter::new().with_private_channels(config.venue.private_channels.clone());
    if let Some(rest) = &config.venue.rest_endpoint {
        adapter = adapter.with_rest_endpoint(rest.clone());
    }

    let metrics = SyncMetrics::new()?;
    let manager = ConnectionManager::new(config.venue.clone(), Arc::new(adapter), metrics)?;
    let state = Arc::new(AppState { manager, config });

    // Start health check server
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    // One long-lived watcher per configured topic
    let url = state.config.venue.ws_endpoint.clone();
    for topic in state.config.topics.clone() {
        let mut subscription = state
            .manager
            .watch_topic(&url, &topic, &Value::Null, WaitMode::Stream)
            .await?;

        tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(update) => debug!(
                        topic = %update.topic,
                        version = update.version,
                        "Topic updated"
                    ),
                    Err(e) if e.is_fatal() => {
                        warn!(topic = %topic, error = %e, "Watcher stopped");
                        break;
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "Topic rejected"),
                }
            }
        });
    }

    // Status logging
    let mut status_interval = interval(Duration::from_secs(state.config.health_check_interval_secs));
    loop {
        tokio::select! {
            _ = status_interval.tick() => log_status(&state),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                state.manager.close();
                return Ok(());
            }
        }
    }
}

fn log_status(state: &AppState) {
    for status in state.manager.statuses() {
        let Some(update) = state.manager.latest(&status.topic) else {
            info!(topic = %status.topic, state = ?status.state, "Topic status");
            continue;
        };
        match update.value.as_ref() {
            TopicValue::OrderBook(book) => info!(
                topic = %status.topic,
                state = ?status.state,
                nonce = ?book.nonce,
                best_bid = ?book.best_bid().map(|l| l.price),
                best_ask = ?book.best_ask().map(|l| l.price),
                "Order book status"
            ),
            TopicValue::Trades(trades) => info!(
                topic = %status.topic,
                state = ?status.state,
                trades = trades.len(),
                last_price = ?trades.last().map(|t| t.price),
                "Trades status"
            ),
            _ => info!(topic = %status.topic, state = ?status.state, "Topic status"),
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "market-sync",
        "topics": state.manager.statuses(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    state
        .manager
        .metrics()
        .encode()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
