//! In-memory connector for driving the connection manager from tests.
//!
//! Every `connect()` call becomes a [`PendingAttempt`] that the test accepts
//! or refuses. Accepted attempts yield a [`FakePeer`] standing in for the
//! backend end of the socket.

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::error::FeedError;
use crate::protocol::WireFrame;
use crate::transport::{Connector, FrameSink, Transport};

pub(crate) struct ScriptedConnector {
    attempts: mpsc::UnboundedSender<PendingAttempt>,
    live: Arc<AtomicUsize>,
}

pub(crate) struct FakeBackend {
    attempts: mpsc::UnboundedReceiver<PendingAttempt>,
    live: Arc<AtomicUsize>,
}

pub(crate) struct PendingAttempt {
    reply: oneshot::Sender<Result<Transport, FeedError>>,
    live: Arc<AtomicUsize>,
}

pub(crate) struct FakePeer {
    inbound: fmpsc::UnboundedSender<Result<WireFrame, FeedError>>,
    outbound: BoxStream<'static, WireFrame>,
}

pub(crate) fn scripted() -> (Arc<ScriptedConnector>, FakeBackend) {
    let (tx, rx) = mpsc::unbounded_channel();
    let live = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(ScriptedConnector {
            attempts: tx,
            live: live.clone(),
        }),
        FakeBackend {
            attempts: rx,
            live,
        },
    )
}

impl Connector for ScriptedConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport, FeedError>> {
        let (reply, result) = oneshot::channel();
        let queued = self
            .attempts
            .send(PendingAttempt {
                reply,
                live: self.live.clone(),
            })
            .is_ok();
        async move {
            if !queued {
                return Err(FeedError::Transport("backend gone".into()));
            }
            result
                .await
                .unwrap_or_else(|_| Err(FeedError::Transport("attempt abandoned".into())))
        }
        .boxed()
    }
}

impl FakeBackend {
    pub(crate) async fn next_attempt(&mut self) -> PendingAttempt {
        self.attempts.recv().await.expect("connector dropped")
    }

    pub(crate) fn no_pending_attempt(&mut self) -> bool {
        self.attempts.try_recv().is_err()
    }

    /// Transport handles the client has not dropped yet.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl PendingAttempt {
    pub(crate) fn accept(self) -> FakePeer {
        let (outbound_tx, outbound_rx) = fmpsc::unbounded();
        let sink = outbound_tx.sink_map_err(|_| FeedError::Transport("peer gone".into()));
        self.open(Box::pin(sink), outbound_rx.boxed())
    }

    /// Accept, but with a peer that takes one outbound frame and then stops
    /// reading until `next_outbound` is called.
    pub(crate) fn accept_stalled(self) -> FakePeer {
        let (outbound_tx, outbound_rx) = fmpsc::channel(0);
        let sink = outbound_tx.sink_map_err(|_| FeedError::Transport("peer gone".into()));
        self.open(Box::pin(sink), outbound_rx.boxed())
    }

    fn open(self, sink: FrameSink, outbound: BoxStream<'static, WireFrame>) -> FakePeer {
        let (inbound_tx, inbound_rx) = fmpsc::unbounded();
        let stream = Tracked {
            inner: inbound_rx.boxed(),
            _guard: LiveGuard::new(self.live),
        };

        let transport = Transport::new(sink, stream.boxed());
        if self.reply.send(Ok(transport)).is_err() {
            panic!("client stopped waiting for the attempt");
        }
        FakePeer {
            inbound: inbound_tx,
            outbound,
        }
    }

    pub(crate) fn refuse(self) {
        let _ = self
            .reply
            .send(Err(FeedError::Transport("connection refused".into())));
    }
}

impl FakePeer {
    pub(crate) fn push_text(&self, text: &str) {
        let _ = self.inbound.unbounded_send(Ok(WireFrame::Text(text.to_string())));
    }

    pub(crate) fn push_binary(&self, bytes: &[u8]) {
        let _ = self.inbound.unbounded_send(Ok(WireFrame::Binary(bytes.to_vec())));
    }

    /// Abrupt transport error.
    pub(crate) fn fail(&self, reason: &str) {
        let _ = self
            .inbound
            .unbounded_send(Err(FeedError::Transport(reason.to_string())));
    }

    /// Clean close from the server side.
    pub(crate) fn close(self) {
        drop(self);
    }

    pub(crate) async fn next_outbound(&mut self) -> Option<WireFrame> {
        self.outbound.next().await
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stream wrapper that keeps the handle counted as live until dropped.
struct Tracked {
    inner: BoxStream<'static, Result<WireFrame, FeedError>>,
    _guard: LiveGuard,
}

impl Stream for Tracked {
    type Item = Result<WireFrame, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
