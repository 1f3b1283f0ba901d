//! # Session Protocol
//!
//! Everything between decoded packets and the client API.
//!
//! ## Components
//! - **Dispatcher**: routes packets to handlers by type tag, with per-attribute coercion
//! - **Connection**: the session state machine and its single inbound worker
//! - **Command**: `command_id` allocation and response correlation
//!
//! ## Session flow
//! ```text
//! client                          relay
//!   |-- request_join -------------->|
//!   |-- request_login (optional) -->|
//!   |<------------- set_identity ---|   session ready
//!   |-- command_* (id N) ---------->|
//!   |<------------ response (id N) -|
//!   |-- request_leave ------------->|
//! ```

pub mod command;
pub mod connection;
pub mod dispatcher;

#[cfg(test)]
mod tests;
