//! Stream framing for bencode packets.
//!
//! Byte-stream transports (raw TCP) have no message boundaries, so the codec
//! walks the buffered bytes with a [`FrameScanner`] and splits off one
//! complete top-level value at a time. The scanner resumes where the previous
//! call stopped, so a large frame arriving in small chunks is walked once.
//! Message-oriented transports (WebSocket) do not need it.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::bencode::{FrameScanner, DEFAULT_MAX_DEPTH};
use crate::error::{ProtocolError, Result};

/// Largest frame accepted from a stream (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_depth: usize,
    max_frame_size: usize,
    scanner: FrameScanner,
}

impl PacketCodec {
    pub fn new(max_depth: usize, max_frame_size: usize) -> Self {
        Self {
            max_depth,
            max_frame_size,
            scanner: FrameScanner::new(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, MAX_FRAME_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.scanner.scan(src, self.max_depth)? {
            Some(len) if len > self.max_frame_size => Err(ProtocolError::Decode(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_size
            ))),
            // Zero-copy split of exactly one frame
            Some(len) => Ok(Some(src.split_to(len).freeze())),
            None if src.len() > self.max_frame_size => {
                self.scanner.reset();
                Err(ProtocolError::Decode(format!(
                    "incomplete frame exceeds limit of {} bytes",
                    self.max_frame_size
                )))
            }
            None => {
                src.reserve(64);
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.len());
        dst.extend_from_slice(item.chunk());
        Ok(())
    }
}
