//! WebSocket module for connection management

mod client;
mod connection;
mod manager;

pub use client::{Inbound, WebSocketClient};
pub use connection::{Connection, ConnectionStatus, Subscription};
pub use manager::{ConnectionManager, TopicStatus};
