//! Transport seam.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! connection manager owns the returned handle exclusively and drops it when
//! the attempt ends.

use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::FeedError;
use crate::protocol::WireFrame;

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = FeedError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<WireFrame, FeedError>>;

/// A live transport handle for a single connection attempt.
///
/// The stream ends when the peer closes; an `Err` item means the transport
/// failed. Either way the handle is finished.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens transport handles to the backend.
pub trait Connector: Send + Sync + 'static {
    /// Resolves once the transport is open, or fails with `FeedError::Transport`.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, FeedError>>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, FeedError>> {
        let url = url.to_owned();
        async move {
            let (ws_stream, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            debug!(url = %url, status = %response.status(), "websocket handshake complete");

            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(FeedError::from)
                .with(|frame: WireFrame| future::ready(Ok::<_, FeedError>(into_message(frame))));

            let stream = read.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.as_str().to_owned()))),
                    Ok(Message::Binary(bytes)) => Some(Ok(WireFrame::Binary(bytes.to_vec()))),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "peer sent close frame");
                        None
                    }
                    // Ping/pong are answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(FeedError::from(e))),
                })
            });

            Ok(Transport::new(Box::pin(sink), stream.boxed()))
        }
        .boxed()
    }
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}
