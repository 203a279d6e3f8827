//! Frame transport to a relay.
//!
//! A relay link never touches sockets directly: it asks a [`Transport`] for a
//! [`FrameChannel`] (a text-frame sink plus a text-frame stream) and treats
//! the end of the stream as a disconnect.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;
use url::Url;

/// Outgoing text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Incoming text frames; `None` means the session is over.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One live session with a relay.
pub struct FrameChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel").finish_non_exhaustive()
    }
}

/// Opens sessions to relays.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<FrameChannel>;
}

/// WebSocket transport backed by tokio-tungstenite.
///
/// Pings are answered by tungstenite itself on the next read. Binary frames
/// are ignored, a Close frame ends the stream.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<FrameChannel> {
        let relay = url.to_string();
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::connection(relay.as_str(), e))?;

        let (write, read) = ws_stream.split();

        let sink_relay = relay.clone();
        let sink = write
            .with(|frame: String| future::ready(Ok::<_, WsError>(Message::Text(frame.into()))))
            .sink_map_err(move |e: WsError| ClientError::connection(sink_relay, e));

        let stream = read
            .scan((), move |_, message| {
                let item = match message {
                    Ok(Message::Text(text)) => Some(Some(Ok(text.as_str().to_owned()))),
                    Ok(Message::Close(frame)) => {
                        debug!(relay = %relay, ?frame, "Relay sent close frame");
                        None
                    }
                    Ok(_) => Some(None),
                    Err(e) => Some(Some(Err(ClientError::connection(relay.as_str(), e)))),
                };
                future::ready(item)
            })
            .filter_map(future::ready);

        Ok(FrameChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
