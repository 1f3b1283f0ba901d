//! # Error Types
//!
//! Error handling for the M2M client protocol engine.
//!
//! This module defines all error variants that can occur while talking to an
//! M2M relay, from malformed bencode at the codec boundary up to command
//! failures reported by the server.
//!
//! ## Error Categories
//! - **Codec Errors**: `Encode` / `Decode` (malformed data, never retried)
//! - **Framing Errors**: `PacketFormat` / `UnknownPacket` / `UnknownPacketName` (a single bad frame is dropped)
//! - **Connection Errors**: transport failed to reach the ready state, or went away
//! - **Command Errors**: timeouts, explicit server failures, invalid responses
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use m2m_client::core::bencode;
//! use m2m_client::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn parse(frame: &[u8]) -> Result<usize> {
//!     let value = bencode::decode(frame)?;
//!     Ok(value.as_list().map(|items| items.len()).unwrap_or(0))
//! }
//!
//! fn main() {
//!     match parse(b"li1ei3e5:helloe") {
//!         Ok(count) => info!(count, "Decoded list"),
//!         Err(e) => error!(error = %e, "Bad frame"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Codec errors
    pub const ERR_UNEXPECTED_END: &str = "unexpected end of input";
    pub const ERR_INVALID_INTEGER: &str = "invalid integer";
    pub const ERR_ILLEGAL_SIZE: &str = "illegal digits in size";
    pub const ERR_DEPTH_EXCEEDED: &str = "containers nested too deeply";

    /// Packet validation errors
    pub const ERR_NOT_A_LIST: &str = "packet must be a list";
    pub const ERR_TYPE_NOT_INT: &str = "first value must be an integer";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_UNABLE_TO_CONNECT: &str = "unable to connect";
    pub const ERR_READY_TIMEOUT: &str = "timed out waiting for the connection to become ready";

    /// Command errors
    pub const ERR_COMMAND_TIMEOUT: &str = "command timed out";
    pub const ERR_INVALID_RESPONSE: &str = "invalid response";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Packet format error: {0}")]
    PacketFormat(String),

    #[error("Unknown packet ({0})")]
    UnknownPacket(i64),

    #[error("Unknown packet name '{0}'")]
    UnknownPacketName(String),

    #[error("Packet registration error: {0}")]
    Registration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Command timed out: {0}")]
    CommandTimeout(String),

    #[error("Command failed: {0}")]
    CommandFail(String),

    #[error("Invalid command response: {0}")]
    InvalidResponse(String),

    #[error("The server didn't send us an identity in time")]
    NoIdentity,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Dispatcher is closed")]
    DispatcherClosed,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// True for errors that concern a single inbound frame. Such frames are
    /// logged and discarded; the connection survives.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::PacketFormat(_)
                | ProtocolError::UnknownPacket(_)
                | ProtocolError::UnknownPacketName(_)
                | ProtocolError::Decode(_)
        )
    }

    /// True for errors reported through a command result.
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::CommandTimeout(_)
                | ProtocolError::CommandFail(_)
                | ProtocolError::InvalidResponse(_)
                | ProtocolError::ConnectionClosed
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
