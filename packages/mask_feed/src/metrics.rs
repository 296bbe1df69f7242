//! Connection counters for diagnostics.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-manager counters. All updates are relaxed and never block.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    // Connection metrics
    /// Connection attempts started
    pub connect_attempts: AtomicU64,
    /// Attempts that reached Connected
    pub connections_opened: AtomicU64,
    /// Failed attempts plus live connections lost
    pub transport_failures: AtomicU64,

    // Inbound metrics
    /// Messages decoded and broadcast
    pub messages_received: AtomicU64,
    /// Payloads dropped because they did not decode
    pub malformed_dropped: AtomicU64,
    /// Messages a lagging subscriber never saw
    pub lagged_dropped: AtomicU64,

    // Outbound metrics
    /// Messages handed to the transport
    pub sends_forwarded: AtomicU64,
    /// `send` calls rejected with NotConnected
    pub sends_rejected: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_started(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_failed(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_dropped(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lag(&self, skipped: u64) {
        self.lagged_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn send_forwarded(&self) {
        self.sends_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_rejected(&self) {
        self.sends_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            lagged_dropped: self.lagged_dropped.load(Ordering::Relaxed),
            sends_forwarded: self.sends_forwarded.load(Ordering::Relaxed),
            sends_rejected: self.sends_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub transport_failures: u64,
    pub messages_received: u64,
    pub malformed_dropped: u64,
    pub lagged_dropped: u64,
    pub sends_forwarded: u64,
    pub sends_rejected: u64,
}
