//! WebSocket transport (`ws://`, `wss://`).
//!
//! Each binary WebSocket message carries exactly one packet. Text messages
//! are not part of the protocol and are ignored.

use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::transport::{link, pump, Transport, TransportEvent, TransportLink};

#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WebSocketTransport {
    #[instrument(skip(self))]
    fn open(&self, url: &str) -> Result<TransportLink> {
        let (link, io) = link();
        let url = url.to_string();

        tokio::spawn(async move {
            let stream = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(e) => {
                    warn!(%url, error = %e, "WebSocket connect rejected");
                    io.emit(TransportEvent::Rejected(e.to_string()));
                    return;
                }
            };
            info!(%url, "WebSocket connected");
            if !io.emit(TransportEvent::Ready) {
                return;
            }

            let (sink, stream) = stream.split();
            let frames = stream.map(|msg| {
                msg.map(|msg| match msg {
                    Message::Binary(data) => Some(data),
                    Message::Text(text) => {
                        warn!(bytes = text.len(), "Ignoring text message");
                        None
                    }
                    Message::Close(frame) => {
                        debug!(?frame, "Close frame received");
                        None
                    }
                    _ => None,
                })
            });
            pump(sink, frames, io, Message::Binary).await;
        });

        Ok(link)
    }
}
