//! Subscription hub over the connection's inbound stream.
//!
//! Every subscription is its own broadcast receiver, so subscriptions never
//! affect each other and each sees messages in transport arrival order.
//! Dropping the last subscription leaves the connection running.

use futures::Stream;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::FeedError;
use crate::metrics::FeedMetrics;
use crate::protocol::{InboundMessage, MessageKind};
use crate::views::{View, ViewHandle};

/// Unique identifier for a subscription
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Fan-out surface handed to consumers in place of the connection itself.
#[derive(Clone)]
pub struct MessageHub {
    connection: Arc<ConnectionManager>,
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl MessageHub {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            next_id: Arc::new(AtomicU64::new(1)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every inbound message, including types this client does not know.
    ///
    /// Starts the connection if needed, so it must be called from within a
    /// tokio runtime.
    pub fn subscribe_all(&self) -> Subscription {
        self.open(None)
    }

    /// Only messages whose `type` is `kind`. Must be called from within a
    /// tokio runtime.
    pub fn subscribe(&self, kind: MessageKind) -> Subscription {
        self.open(Some(kind))
    }

    /// Start a consumer that folds `V::KIND` messages into its view state.
    /// Spawns the runner task, so it must be called from within a tokio
    /// runtime.
    pub fn activate<V: View>(&self) -> ViewHandle<V> {
        ViewHandle::spawn(self.subscribe(V::KIND))
    }

    /// Forward an opaque message to the backend; see [`ConnectionManager::send`].
    pub fn send(&self, message: &Value) -> Result<(), FeedError> {
        self.connection.send(message)
    }

    pub fn subscriber_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn open(&self, filter: Option<MessageKind>) -> Subscription {
        // The first subscriber starts the connection; later calls are no-ops
        let rx = if self.connection.is_closed() {
            self.connection.inbound_receiver()
        } else {
            self.connection.connect()
        };

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(subscription = %id, filter = ?filter, "subscription opened");

        Subscription {
            id,
            filter,
            rx,
            metrics: self.connection.metrics_handle(),
            active: self.active.clone(),
        }
    }
}

/// A live subscription. Dropping it (or calling `unsubscribe`) stops delivery
/// immediately; nothing buffered is delivered afterwards.
pub struct Subscription {
    id: SubscriptionId,
    filter: Option<MessageKind>,
    rx: broadcast::Receiver<InboundMessage>,
    metrics: Arc<FeedMetrics>,
    active: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> Option<MessageKind> {
        self.filter
    }

    /// Next matching message. `None` once the connection manager is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.accepts(&msg) => return Some(msg),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching message if one is already queued.
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if self.accepts(&msg) => return Some(msg),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = InboundMessage> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|msg| (msg, sub))
        })
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    fn accepts(&self, msg: &InboundMessage) -> bool {
        match self.filter {
            None => true,
            Some(kind) => msg.kind() == Some(kind),
        }
    }

    fn lagged(&self, skipped: u64) {
        warn!(subscription = %self.id, skipped, "subscriber fell behind; messages dropped");
        self.metrics.record_lag(skipped);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(subscription = %self.id, "subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use crate::protocol::{FrameData, FramePayload};
    use crate::test_support::{FakeBackend, FakePeer, scripted};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn hub() -> (MessageHub, Arc<ConnectionManager>, FakeBackend) {
        let (connector, backend) = scripted();
        let manager = Arc::new(ConnectionManager::with_connector(
            FeedConfig::default(),
            connector,
        ));
        (MessageHub::new(manager.clone()), manager, backend)
    }

    async fn connected(manager: &ConnectionManager, backend: &mut FakeBackend) -> FakePeer {
        let peer = backend.next_attempt().await.accept();
        manager
            .state_changes()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        peer
    }

    fn stats(total: u64) -> String {
        format!(r#"{{"type":"stats","total":{total},"with_mask":{total},"without_mask":0}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscriber_starts_connection() {
        let (hub, manager, mut backend) = hub();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(backend.no_pending_attempt());

        let _a = hub.subscribe_all();
        let _b = hub.subscribe(MessageKind::Stats);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.connection_state(), ConnectionState::Connecting);

        let _peer = connected(&manager, &mut backend).await;
        assert!(backend.no_pending_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_have_distinct_ids() {
        let (hub, _manager, _backend) = hub();
        let all = hub.subscribe_all();
        let stats = hub.subscribe(MessageKind::Stats);

        assert_ne!(all.id(), stats.id());
        assert_eq!(all.filter(), None);
        assert_eq!(stats.filter(), Some(MessageKind::Stats));
        assert_eq!(stats.id().to_string(), format!("sub-{}", stats.id().0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_subscription_sees_arrival_order() {
        let (hub, manager, mut backend) = hub();
        let mut all_a = hub.subscribe_all();
        let mut all_b = hub.subscribe_all();
        let peer = connected(&manager, &mut backend).await;

        let sent = [
            stats(1),
            r#"{"type":"frame","frame":"f1"}"#.to_string(),
            r#"{"type":"time_stats","avg_time_with_mask":1,"avg_time_without_mask":2,"total_time":3}"#
                .to_string(),
            stats(2),
            r#"{"type":"history","history":[]}"#.to_string(),
        ];
        for text in &sent {
            peer.push_text(text);
        }

        for sub in [&mut all_a, &mut all_b] {
            let mut kinds = Vec::new();
            for _ in 0..sent.len() {
                kinds.push(sub.recv().await.unwrap().type_name().to_string());
            }
            assert_eq!(kinds, ["stats", "frame", "time_stats", "stats", "history"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_subscription_skips_other_and_unknown_types() {
        let (hub, manager, mut backend) = hub();
        let mut all = hub.subscribe_all();
        let mut only_stats = hub.subscribe(MessageKind::Stats);
        let peer = connected(&manager, &mut backend).await;

        peer.push_text(r#"{"type":"unknown_future_type","x":1}"#);
        peer.push_text(r#"{"type":"frame","frame":"f"}"#);
        peer.push_text(&stats(10));

        assert_eq!(all.recv().await.unwrap().type_name(), "unknown_future_type");
        assert_eq!(all.recv().await.unwrap().type_name(), "frame");
        assert_eq!(all.recv().await.unwrap().type_name(), "stats");

        let first = only_stats.recv().await.unwrap();
        assert_eq!(first.kind(), Some(MessageKind::Stats));
        assert!(only_stats.try_recv().is_none());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_frames_reach_frame_subscribers() {
        let (hub, manager, mut backend) = hub();
        let mut frames = hub.subscribe(MessageKind::Frame);
        let peer = connected(&manager, &mut backend).await;

        peer.push_binary(&[0xff, 0xd8, 0xff]);
        assert_eq!(
            frames.recv().await.unwrap(),
            InboundMessage::Frame(FramePayload {
                data: FrameData::Raw(vec![0xff, 0xd8, 0xff])
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_gets_no_backlog() {
        let (hub, manager, mut backend) = hub();
        let mut early = hub.subscribe_all();
        let peer = connected(&manager, &mut backend).await;

        peer.push_text(&stats(1));
        peer.push_text(&stats(2));
        early.recv().await.unwrap();
        early.recv().await.unwrap();

        let mut late = hub.subscribe_all();
        assert!(late.try_recv().is_none());

        peer.push_text(&stats(3));
        match late.recv().await.unwrap() {
            InboundMessage::Stats(s) => assert_eq!(s.total, 3),
            other => panic!("Expected Stats, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_leaves_others_and_connection_alone() {
        let (hub, manager, mut backend) = hub();
        let first = hub.subscribe_all();
        let mut second = hub.subscribe_all();
        let peer = connected(&manager, &mut backend).await;

        peer.push_text(&stats(1));
        first.unsubscribe();
        assert_eq!(hub.subscriber_count(), 1);
        peer.push_text(&stats(2));
        peer.push_text(&stats(3));

        let mut totals = Vec::new();
        for _ in 0..3 {
            if let Some(InboundMessage::Stats(s)) = second.recv().await {
                totals.push(s.total);
            }
        }
        assert_eq!(totals, vec![1, 2, 3]);

        drop(second);
        assert_eq!(hub.subscriber_count(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_as_stream() {
        let (hub, manager, mut backend) = hub();
        let stream = hub.subscribe(MessageKind::Stats).into_stream();
        let peer = connected(&manager, &mut backend).await;

        peer.push_text(&stats(4));
        peer.push_text(r#"{"type":"frame","frame":"f"}"#);
        peer.push_text(&stats(5));

        let totals: Vec<u64> = stream
            .take(2)
            .filter_map(|msg| async move {
                match msg {
                    InboundMessage::Stats(s) => Some(s.total),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(totals, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_lags_but_keeps_order() {
        let (connector, mut backend) = scripted();
        let config = FeedConfig {
            channel_capacity: 2,
            ..Default::default()
        };
        let manager = Arc::new(ConnectionManager::with_connector(config, connector));
        let hub = MessageHub::new(manager.clone());
        let mut fast = hub.subscribe_all();
        let mut slow = hub.subscribe_all();
        let peer = connected(&manager, &mut backend).await;

        for total in 1..=4 {
            peer.push_text(&stats(total));
            fast.recv().await.unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(Some(InboundMessage::Stats(s))) =
            timeout(Duration::from_millis(10), slow.recv()).await
        {
            seen.push(s.total);
        }
        assert_eq!(seen, vec![3, 4]);
        assert_eq!(manager.metrics().lagged_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_after_close_does_not_reconnect() {
        let (hub, manager, mut backend) = hub();
        manager.close();
        let mut sub = hub.subscribe_all();
        assert!(sub.try_recv().is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(backend.no_pending_attempt());
        assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
    }
}
