//! # Client Service
//!
//! The application-facing layer: [`client::Client`] performs the handshake,
//! owns the session and exposes relay commands as typed calls.

pub mod client;

pub use client::{Client, Inbound};
