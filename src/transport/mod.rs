//! # Transport Layer
//!
//! The connection engine talks to the relay through a [`Transport`]: opening
//! a URL yields a [`TransportLink`], a non-blocking [`TransportSender`] plus
//! an ordered feed of [`TransportEvent`]s driven by a background task.
//!
//! ## Implementations
//! - **WebSocket** (`ws://`, `wss://`): one binary message per packet
//! - **TCP** (`tcp://`): raw stream split into frames by `PacketCodec`
//! - **Memory**: in-process pair with a scripted server end, for tests and demos
//!
//! Transport security is the transport's concern; the engine only sees frames.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};

pub mod memory;
pub mod tcp;
pub mod websocket;

/// Something that happened on the wire, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open and frames may flow
    Ready,
    /// One complete inbound frame
    Binary(Bytes),
    /// The connection could not be established
    Rejected(String),
    /// The connection ended
    Disconnected { graceful: bool, reason: String },
}

/// Work queued for the transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Close,
}

/// Thread-safe, non-blocking handle for outbound traffic.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportSender {
    /// Queue one frame. Fails once the transport task has gone away.
    pub fn send_binary(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(Outbound::Binary(data))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Ask the transport to close. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The caller's half of an open transport
#[derive(Debug)]
pub struct TransportLink {
    pub sender: TransportSender,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The transport task's half of a link
#[derive(Debug)]
pub struct TransportIo {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportIo {
    /// Deliver an event. Returns false once nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// A linked pair of channels: the caller's link and the task's io.
pub fn link() -> (TransportLink, TransportIo) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    (
        TransportLink {
            sender: TransportSender { tx: out_tx },
            events: ev_rx,
        },
        TransportIo {
            outbound: out_rx,
            events: ev_tx,
        },
    )
}

/// Opens connections to a relay.
///
/// `open` returns immediately; the outcome arrives on the event feed as
/// `Ready` or `Rejected`. Must be called from within a Tokio runtime.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<TransportLink>;
}

/// Pick the bundled transport for `url`'s scheme.
pub fn for_url(url: &str) -> Result<Box<dyn Transport>> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| ProtocolError::Connection(format!("invalid URL '{url}'")))?;
    match scheme.as_str() {
        "ws" | "wss" => Ok(Box::new(websocket::WebSocketTransport::new())),
        "tcp" => Ok(Box::new(tcp::TcpTransport::new())),
        other => Err(ProtocolError::Connection(format!(
            "no transport for scheme '{other}'"
        ))),
    }
}

/// Shuttle frames between a connected sink/stream pair and the link until
/// either side finishes, then report how the connection ended.
pub(crate) async fn pump<S, R, T, E>(
    mut sink: S,
    mut stream: R,
    mut io: TransportIo,
    wrap: fn(Bytes) -> T,
)
where
    S: Sink<T> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = std::result::Result<Option<Bytes>, E>> + Unpin,
    E: std::fmt::Display,
{
    let (graceful, reason) = loop {
        tokio::select! {
            out = io.outbound.recv() => match out {
                Some(Outbound::Binary(data)) => {
                    if let Err(e) = sink.send(wrap(data)).await {
                        break (false, format!("send failed: {e}"));
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break (true, "closed by client".to_string());
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Some(data))) => {
                    if !io.emit(TransportEvent::Binary(data)) {
                        let _ = sink.close().await;
                        break (true, "receiver dropped".to_string());
                    }
                }
                // Control traffic with no payload for the engine
                Some(Ok(None)) => {}
                Some(Err(e)) => break (false, e.to_string()),
                None => break (true, constants::ERR_CONNECTION_CLOSED.to_string()),
            },
        }
    };

    if graceful {
        debug!(%reason, "Transport closed");
    } else {
        warn!(%reason, "Transport failed");
    }
    io.emit(TransportEvent::Disconnected { graceful, reason });
}
