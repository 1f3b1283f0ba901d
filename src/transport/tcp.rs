//! Raw TCP transport (`tcp://host:port`).
//!
//! Packets are written back to back with no extra framing; the reader
//! recovers boundaries from the bencode structure itself.

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{info, instrument, warn};

use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};
use crate::transport::{link, pump, Transport, TransportEvent, TransportLink};

#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    codec: PacketCodec,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: PacketCodec) -> Self {
        Self { codec }
    }
}

/// `host:port` from `tcp://host:port[/...]`
fn address(url: &str) -> Result<String> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let addr = rest.split('/').next().unwrap_or_default();
    if addr.is_empty() {
        return Err(ProtocolError::Connection(format!("no address in '{url}'")));
    }
    Ok(addr.to_string())
}

impl Transport for TcpTransport {
    #[instrument(skip(self))]
    fn open(&self, url: &str) -> Result<TransportLink> {
        let addr = address(url)?;
        let codec = self.codec.clone();
        let (link, io) = link();

        tokio::spawn(async move {
            let stream = match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%addr, error = %e, "TCP connect rejected");
                    io.emit(TransportEvent::Rejected(e.to_string()));
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            info!(%addr, "TCP connected");
            if !io.emit(TransportEvent::Ready) {
                return;
            }

            let (sink, stream) = Framed::new(stream, codec).split();
            let frames = stream.map(|frame| frame.map(Some));
            pump(sink, frames, io, std::convert::identity::<Bytes>).await;
        });

        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_address_parsing() {
        assert_eq!(address("tcp://127.0.0.1:2021").unwrap(), "127.0.0.1:2021");
        assert_eq!(address("tcp://relay:9/m2m").unwrap(), "relay:9");
        assert!(address("tcp://").is_err());
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, PacketCodec::default());
            let first = framed.next().await.unwrap().unwrap();
            framed.send(Bytes::from_static(b"li3ee")).await.unwrap();
            first
        });

        let mut link = TcpTransport::new()
            .open(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();
        assert_eq!(link.events.recv().await, Some(TransportEvent::Ready));
        link.sender
            .send_binary(Bytes::from_static(b"li1ee"))
            .unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(TransportEvent::Binary(Bytes::from_static(b"li3ee")))
        );
        assert_eq!(&server.await.unwrap()[..], b"li1ee");
    }

    #[tokio::test]
    async fn test_refused_connection_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut link = TcpTransport::new()
            .open(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();
        assert!(matches!(
            link.events.recv().await,
            Some(TransportEvent::Rejected(_))
        ));
    }
}
