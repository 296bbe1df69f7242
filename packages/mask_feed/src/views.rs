//! Derived view state for the dashboard consumers.
//!
//! A view lives exactly as long as its [`ViewHandle`]: activation spawns a
//! runner over a filtered subscription, and dropping the handle stops the
//! runner and discards the state.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hub::Subscription;
use crate::protocol::{FrameData, HistoryRecord, InboundMessage, MessageKind};

/// A consumer's latest-known values for one message kind.
pub trait View: Default + Clone + Send + Sync + 'static {
    const KIND: MessageKind;

    /// Fold a message into the view. Returns whether anything changed.
    fn apply(&mut self, msg: &InboundMessage) -> bool;
}

/// Mask/no-mask counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsView {
    pub total: u64,
    pub with_mask: u64,
    pub without_mask: u64,
}

impl View for StatsView {
    const KIND: MessageKind = MessageKind::Stats;

    fn apply(&mut self, msg: &InboundMessage) -> bool {
        let InboundMessage::Stats(stats) = msg else {
            return false;
        };
        let next = StatsView {
            total: stats.total,
            with_mask: stats.with_mask,
            without_mask: stats.without_mask,
        };
        if *self == next {
            return false;
        }
        *self = next;
        true
    }
}

/// Detection history. The backend always sends the whole list, so each
/// message replaces what was there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryView {
    pub records: Vec<HistoryRecord>,
}

impl HistoryView {
    pub fn latest(&self) -> Option<&HistoryRecord> {
        self.records.iter().max_by_key(|r| r.timestamp)
    }

    pub fn without_mask_count(&self) -> usize {
        self.records.iter().filter(|r| !r.with_mask).count()
    }
}

impl View for HistoryView {
    const KIND: MessageKind = MessageKind::History;

    fn apply(&mut self, msg: &InboundMessage) -> bool {
        let InboundMessage::History(payload) = msg else {
            return false;
        };
        if self.records == payload.history {
            return false;
        }
        self.records = payload.history.clone();
        true
    }
}

/// Time-in-state aggregates, in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeStatsView {
    pub avg_time_with_mask: f64,
    pub avg_time_without_mask: f64,
    pub total_time: f64,
}

impl View for TimeStatsView {
    const KIND: MessageKind = MessageKind::TimeStats;

    fn apply(&mut self, msg: &InboundMessage) -> bool {
        let InboundMessage::TimeStats(t) = msg else {
            return false;
        };
        let next = TimeStatsView {
            avg_time_with_mask: t.avg_time_with_mask,
            avg_time_without_mask: t.avg_time_without_mask,
            total_time: t.total_time,
        };
        if *self == next {
            return false;
        }
        *self = next;
        true
    }
}

/// Latest video frame and how many have arrived since activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoView {
    pub latest: Option<FrameData>,
    pub frames_seen: u64,
}

impl View for VideoView {
    const KIND: MessageKind = MessageKind::Frame;

    fn apply(&mut self, msg: &InboundMessage) -> bool {
        let InboundMessage::Frame(frame) = msg else {
            return false;
        };
        self.latest = Some(frame.data.clone());
        self.frames_seen += 1;
        true
    }
}

/// An active consumer. Dropping it deactivates the consumer.
pub struct ViewHandle<V: View> {
    rx: watch::Receiver<V>,
    task: JoinHandle<()>,
}

impl<V: View> ViewHandle<V> {
    /// Run a view over `subscription` until the handle is dropped.
    ///
    /// `subscription` should be filtered to `V::KIND`; anything else it yields
    /// is ignored by `apply`.
    pub fn spawn(mut subscription: Subscription) -> Self {
        if subscription.filter() != Some(V::KIND) {
            warn!(
                subscription = %subscription.id(),
                kind = %V::KIND,
                filter = ?subscription.filter(),
                "view runner over a subscription with a different filter"
            );
        }
        let (tx, rx) = watch::channel(V::default());
        let task = tokio::spawn(async move {
            debug!(subscription = %subscription.id(), kind = %V::KIND, "view runner started");
            while let Some(msg) = subscription.recv().await {
                tx.send_if_modified(|view| view.apply(&msg));
            }
            debug!(subscription = %subscription.id(), kind = %V::KIND, "view runner finished");
        });
        Self { rx, task }
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> V {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new state. `None` once the
    /// underlying connection manager is gone.
    pub async fn changed(&mut self) -> Option<V> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn deactivate(self) {
        drop(self);
    }
}

impl<V: View> Drop for ViewHandle<V> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
