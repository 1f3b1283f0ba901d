//! # m2m-client
//!
//! Client protocol engine for the M2M relay.
//!
//! A client holds one persistent connection to a relay, exchanges small
//! bencoded packets over it, receives a server-assigned identity and issues
//! request/response commands that are correlated by id.
//!
//! ## Layers
//! - [`core`]: bencode codec, decode cache, packet schemas and registry
//! - [`protocol`]: dispatcher, connection state machine, command correlator
//! - [`transport`]: WebSocket, TCP and in-memory transports
//! - [`service`]: the [`Client`] facade
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, CodecConfig, LoggingConfig, M2mConfig};
pub use crate::core::bencode::{Dict, Value};
pub use crate::core::packet::{registry, Packet, PacketType, Registry};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::command::CommandResult;
pub use crate::protocol::connection::ConnectionState;
pub use crate::service::{Client, Inbound};
