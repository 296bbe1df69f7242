//! ConnectionManager: the single logical connection to the detection backend.
//!
//! One supervisor task owns the transport handle. It opens a handle, pumps
//! frames in both directions until the handle fails, waits the fixed reconnect
//! delay, and tries again, until `close()` is called.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!                                  ▲   │ fail           │ close / error
//!                          delay   │   ▼                ▼
//!                                  └── Reconnecting ◀───┘
//! any ──close()──▶ Disconnected (terminal)
//! ```

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::metrics::{FeedMetrics, MetricsSnapshot};
use crate::protocol::{InboundMessage, WireFrame};
use crate::transport::{Connector, Transport, WsConnector};

/// How long a graceful close may take before the handle is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Capacity of the transition broadcast. Diagnostics only.
const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Mutable connection bookkeeping. Guarded by one lock so that state, the
/// outbound writer and the closed flag always change together.
struct Lifecycle {
    state: ConnectionState,
    /// Writer into the live transport; `Some` only while Connected
    outbound: Option<mpsc::Sender<WireFrame>>,
    started: bool,
    closed: bool,
}

struct Shared {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    transitions_tx: broadcast::Sender<StateTransition>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    metrics: Arc<FeedMetrics>,
    cancel: CancellationToken,
}

/// Why a live transport stopped pumping.
enum PumpExit {
    Cancelled,
    Lost(FeedError),
}

/// Owns the one connection to the backend and the shared inbound stream.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager that connects over WebSocket. Nothing is opened until
    /// `connect()` is called.
    pub fn new(config: FeedConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: FeedConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    started: false,
                    closed: false,
                }),
                state_tx,
                transitions_tx,
                inbound_tx,
                metrics: Arc::new(FeedMetrics::new()),
                cancel: CancellationToken::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start the connection if it is not running and return a receiver on the
    /// shared inbound stream.
    ///
    /// Idempotent: while Connecting/Connected/Reconnecting no second handle is
    /// opened. After `close()` the receiver is returned but nothing restarts.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> broadcast::Receiver<InboundMessage> {
        let rx = self.shared.inbound_tx.subscribe();

        {
            let mut lc = self.shared.lifecycle();
            if lc.closed {
                warn!("connect() called on a closed connection manager; not reconnecting");
                return rx;
            }
            if lc.started {
                return rx;
            }
            lc.started = true;
            self.shared.apply_transition(&mut lc, ConnectionState::Connecting);
        }

        let handle = tokio::spawn(supervise(self.shared.clone()));
        *lock(&self.supervisor) = Some(handle);
        rx
    }

    /// Forward an opaque JSON message to the backend.
    ///
    /// Only succeeds while Connected; otherwise the message is dropped and
    /// `FeedError::NotConnected` is returned. If the backend has stopped
    /// reading and `channel_capacity` messages are already queued, the message
    /// is dropped with `FeedError::QueueFull`. Never blocks.
    pub fn send(&self, message: &Value) -> Result<(), FeedError> {
        let lc = self.shared.lifecycle();
        let writer = lc
            .outbound
            .as_ref()
            .filter(|_| lc.state == ConnectionState::Connected);

        let result = match writer {
            Some(tx) => match tx.try_send(WireFrame::Text(message.to_string())) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => Err(FeedError::QueueFull),
                Err(TrySendError::Closed(_)) => Err(FeedError::NotConnected),
            },
            None => Err(FeedError::NotConnected),
        };

        self.shared.metrics.send_rejected();
        match &result {
            Err(FeedError::QueueFull) => {
                warn!(
                    capacity = self.shared.config.channel_capacity,
                    "dropping outbound message: backend is not reading"
                );
            }
            _ => debug!(state = %lc.state, "dropping outbound message: not connected"),
        }
        result
    }

    /// Transition to Disconnected, release the live handle, cancel any pending
    /// reconnect, and stop for good.
    pub fn close(&self) {
        {
            let mut lc = self.shared.lifecycle();
            if lc.closed {
                return;
            }
            self.shared.apply_transition(&mut lc, ConnectionState::Disconnected);
            lc.outbound = None;
            lc.closed = true;
        }
        self.shared.cancel.cancel();
        info!(url = %self.shared.config.url, "connection manager closed");
    }

    /// `close()` and wait for the supervisor to release the transport.
    pub async fn shutdown(&self) {
        self.close();
        let handle = lock(&self.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "connection supervisor ended abnormally");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle().state
    }

    /// Watch the current state. Intermediate states may be coalesced; use
    /// `subscribe_transitions` for the full trace.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Every state transition, in order, from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifecycle().closed
    }

    pub fn config(&self) -> &FeedConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> Arc<FeedMetrics> {
        self.shared.metrics.clone()
    }

    /// A receiver on the inbound stream without starting the connection.
    pub(crate) fn inbound_receiver(&self) -> broadcast::Receiver<InboundMessage> {
        self.shared.inbound_tx.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    /// Apply a transition unless the manager has been closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut lc = self.lifecycle();
        if lc.closed {
            return false;
        }
        self.apply_transition(&mut lc, to);
        true
    }

    fn apply_transition(&self, lc: &mut Lifecycle, to: ConnectionState) {
        let from = lc.state;
        if from == to {
            return;
        }
        lc.state = to;
        if to != ConnectionState::Connected {
            lc.outbound = None;
        }
        self.state_tx.send_replace(to);
        // No transition subscribers is fine
        let _ = self.transitions_tx.send(StateTransition { from, to });
        info!(%from, %to, "connection state changed");
    }

    /// Install the writer for a freshly opened transport and enter Connected.
    fn open(&self, outbound: mpsc::Sender<WireFrame>) -> bool {
        let mut lc = self.lifecycle();
        if lc.closed {
            return false;
        }
        lc.outbound = Some(outbound);
        self.apply_transition(&mut lc, ConnectionState::Connected);
        true
    }

    async fn pump(
        &self,
        transport: Transport,
        mut outbound: mpsc::Receiver<WireFrame>,
    ) -> PumpExit {
        let Transport {
            mut sink,
            mut stream,
        } = transport;

        let exit = {
            // Reads and writes progress independently; a peer that stops
            // reading must not stall inbound delivery
            let reader = async {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(frame) => self.forward(frame),
                        Err(e) => return e,
                    }
                }
                FeedError::Transport("connection closed by peer".into())
            };
            let writer = async {
                while let Some(frame) = outbound.recv().await {
                    if let Err(e) = sink.send(frame).await {
                        return e;
                    }
                    self.metrics.send_forwarded();
                }
                // The queue only closes on close(), which also cancels
                futures::future::pending::<FeedError>().await
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => PumpExit::Cancelled,
                e = reader => PumpExit::Lost(e),
                e = writer => PumpExit::Lost(e),
            }
        };

        if matches!(exit, PumpExit::Cancelled) {
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
        }
        exit
    }

    /// Decode one inbound frame and broadcast it.
    fn forward(&self, frame: WireFrame) {
        let msg = match InboundMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.malformed_dropped();
                debug!(error = %e, "dropping malformed inbound message");
                return;
            }
        };

        if let InboundMessage::Unknown { kind, .. } = &msg {
            debug!(kind = %kind, "received message with unknown type");
        }

        // Held across the send so nothing is forwarded once close() returns
        let lc = self.lifecycle();
        if lc.closed {
            return;
        }
        self.metrics.message_received();
        // No subscribers is fine; the message is simply not observed
        let _ = self.inbound_tx.send(msg);
    }
}

/// Supervisor loop. Attempts are strictly sequential: the previous handle is
/// dropped before the reconnect delay starts.
async fn supervise(shared: Arc<Shared>) {
    let url = shared.config.url.clone();
    let delay = shared.config.reconnect_delay;
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        shared.metrics.attempt_started();
        info!(url = %url, attempt, "connecting to detection backend");

        let opened = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = shared.connector.connect(&url) => result,
        };

        match opened {
            Ok(transport) => {
                let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.channel_capacity);
                if !shared.open(outbound_tx) {
                    break;
                }
                shared.metrics.connection_opened();
                info!(url = %url, attempt, "connected to detection backend");

                match shared.pump(transport, outbound_rx).await {
                    PumpExit::Cancelled => break,
                    PumpExit::Lost(e) => {
                        warn!(url = %url, code = e.error_code(), error = %e, "connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(
                    url = %url,
                    attempt,
                    code = e.error_code(),
                    error = %e,
                    "connection attempt failed"
                );
            }
        }

        shared.metrics.transport_failed();
        if !shared.transition(ConnectionState::Reconnecting) {
            break;
        }
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if !shared.transition(ConnectionState::Connecting) {
            break;
        }
    }

    debug!(url = %url, "connection supervisor stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
