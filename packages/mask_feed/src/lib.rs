//! Mask Feed - reconnecting event-feed client for the mask detection dashboard
//!
//! One [`ConnectionManager`] keeps a single WebSocket to the detection backend
//! alive across disconnects. A [`MessageHub`] fans its inbound stream out to
//! independent subscriptions, and the [`views`] fold those into per-consumer
//! state (counts, history, time aggregates, latest frame).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mask_feed::{ConnectionManager, FeedConfig, MessageHub, MessageKind, StatsView};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = FeedConfig::new("ws://localhost:5000/ws").unwrap();
//!     let manager = Arc::new(ConnectionManager::new(config));
//!     let hub = MessageHub::new(manager.clone());
//!
//!     // Derived view, kept up to date in the background
//!     let mut stats = hub.activate::<StatsView>();
//!
//!     // Raw filtered subscription
//!     let mut history = hub.subscribe(MessageKind::History);
//!
//!     tokio::select! {
//!         Some(view) = stats.changed() => println!("{} detections", view.total),
//!         Some(msg) = history.recv() => println!("{:?}", msg),
//!     }
//!
//!     manager.shutdown().await;
//! }
//! ```

pub mod config;
pub mod connection;
mod error;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod transport;
pub mod views;

#[cfg(test)]
mod test_support;

pub use config::FeedConfig;
pub use connection::{ConnectionManager, ConnectionState, StateTransition};
pub use error::FeedError;
pub use hub::{MessageHub, Subscription, SubscriptionId};
pub use metrics::MetricsSnapshot;
pub use protocol::{
    FrameData, FramePayload, HistoryPayload, HistoryRecord, InboundMessage, MessageKind,
    StatsPayload, TimeStatsPayload, WireFrame,
};
pub use views::{HistoryView, StatsView, TimeStatsView, VideoView, View, ViewHandle};
