//! In-process transport with a scripted server end.
//!
//! [`pair`] returns a [`MemoryTransport`] for the client and a
//! [`MemoryServer`] that accepts each connection the client opens as a
//! [`MemoryPeer`]. The peer decides whether the connection becomes ready,
//! reads the client's packets and writes packets or raw frames back.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::packet::{registry, Packet};
use crate::error::{ProtocolError, Result};
use crate::transport::{link, Outbound, Transport, TransportEvent, TransportIo, TransportLink};

/// Client half of an in-memory relay
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    accept: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half: yields one peer per opened connection
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// The server's view of one client connection
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    io: TransportIo,
}

pub fn pair() -> (MemoryTransport, MemoryServer) {
    let (accept, incoming) = mpsc::unbounded_channel();
    (MemoryTransport { accept }, MemoryServer { incoming })
}

impl Transport for MemoryTransport {
    fn open(&self, url: &str) -> Result<TransportLink> {
        let (link, io) = link();
        let peer = MemoryPeer {
            url: url.to_string(),
            io,
        };
        self.accept
            .send(peer)
            .map_err(|_| ProtocolError::Connection("memory server is gone".into()))?;
        Ok(link)
    }
}

impl MemoryServer {
    /// Next connection opened by a client
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Let the connection reach the ready state
    pub fn ready(&self) {
        self.io.emit(TransportEvent::Ready);
    }

    /// Refuse the connection
    pub fn reject(self, reason: &str) {
        self.io.emit(TransportEvent::Rejected(reason.to_string()));
    }

    /// End the connection from the server side
    pub fn disconnect(self, graceful: bool, reason: &str) {
        self.io.emit(TransportEvent::Disconnected {
            graceful,
            reason: reason.to_string(),
        });
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        self.send_raw(packet.to_wire()?)
    }

    /// Deliver an arbitrary frame, well-formed or not
    pub fn send_raw(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.io.emit(TransportEvent::Binary(data.into())) {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Next frame from the client, or `None` once it closed the connection
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        match self.io.outbound.recv().await? {
            Outbound::Binary(data) => Some(data),
            Outbound::Close => {
                debug!(url = %self.url, "Client closed memory connection");
                self.io.emit(TransportEvent::Disconnected {
                    graceful: true,
                    reason: "closed by client".into(),
                });
                None
            }
        }
    }

    /// Next packet from the client, or `None` once it closed the connection
    pub async fn recv(&mut self) -> Option<Result<Packet>> {
        let data = self.recv_raw().await?;
        Some(registry().from_wire(&data))
    }
}
