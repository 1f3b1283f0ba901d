//! # Core Protocol Components
//!
//! Wire-level building blocks: the bencode codec, the packet model and its
//! registry, and stream framing.
//!
//! ## Components
//! - **Bencode**: `Value` encode/decode with bounded lookahead and a decode cache
//! - **Packet**: typed packet schemas, the tag registry, wire conversion
//! - **Codec**: Tokio codec that splits a byte stream into bencode frames
//!
//! ## Wire Format
//! ```text
//! l i<tag>e <attr 1> <attr 2> ... e
//! ```
//!
//! ## Safety limits
//! - Container nesting: 64 levels by default
//! - Stream frames: 16MB maximum
//! - Length prefixes and integers are located within a bounded lookahead

pub mod bencode;
pub mod codec;
pub mod packet;
