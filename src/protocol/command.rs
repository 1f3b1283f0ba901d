//! # Command Correlator
//!
//! Commands are packets that carry a locally assigned `command_id` and expect
//! one `response` packet echoing it. The correlator allocates ids, keeps one
//! pending slot per in-flight command, and completes the slot when the
//! response is dispatched or when the connection is torn down.
//!
//! A caller that stops waiting (timeout or drop) reclaims its id at once. A
//! response arriving later is logged as unknown and dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::bencode::{Dict, Value};
use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::Connection;

/// Success sentinel in a command result's `status` field
pub const STATUS_OK: &[u8] = b"ok";

type Outcome = Result<Dict>;

struct Slot {
    name: &'static str,
    issued_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    /// Set on teardown; no new slots after that
    closed: bool,
    last_id: i64,
    slots: HashMap<i64, Slot>,
}

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Correlator {
    connection: Arc<Connection>,
    default_timeout: Duration,
    pending: Mutex<PendingTable>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Correlator {
    /// Create a correlator for `connection`. Pending commands fail with
    /// `ConnectionClosed` when the connection tears down.
    pub fn new(connection: Arc<Connection>, default_timeout: Duration) -> Arc<Self> {
        let correlator = Arc::new(Self {
            connection,
            default_timeout,
            pending: Mutex::new(PendingTable::default()),
        });
        let weak = Arc::downgrade(&correlator);
        correlator.connection.on_teardown(move || {
            if let Some(correlator) = weak.upgrade() {
                correlator.fail_all();
            }
        });
        correlator
    }

    /// Send command `kind` with `fields` plus a fresh `command_id`.
    ///
    /// The returned handle resolves to the server's result mapping. If the
    /// packet cannot be built or sent, the handle is already failed.
    pub fn issue(self: &Arc<Self>, kind: PacketType, fields: Vec<(&str, Value)>) -> CommandResult {
        let (tx, rx) = oneshot::channel();
        let name = kind.name();

        let id = {
            let mut table = lock(&self.pending);
            if table.closed {
                drop(table);
                let _ = tx.send(Err(ProtocolError::ConnectionClosed));
                return CommandResult::new(0, name, rx, self);
            }
            table.last_id += 1;
            let id = table.last_id;
            table.slots.insert(
                id,
                Slot {
                    name,
                    issued_at: Instant::now(),
                    tx,
                },
            );
            id
        };
        self.connection.counters().command_issued();

        let mut named = Vec::with_capacity(fields.len() + 1);
        named.push(("command_id", Value::Int(id)));
        named.extend(fields);

        match Packet::with_named(kind, named) {
            Ok(packet) => {
                if !self.connection.send(&packet) {
                    self.complete(id, Err(ProtocolError::ConnectionClosed));
                }
            }
            Err(e) => {
                self.complete(id, Err(e));
            }
        }

        CommandResult::new(id, name, rx, self)
    }

    /// Complete the slot for a `response` packet.
    pub fn handle_response(&self, command_id: i64, result: &Value) {
        let slot = lock(&self.pending).slots.remove(&command_id);
        let Some(slot) = slot else {
            self.connection.counters().orphan_response();
            warn!(command_id, "Received a response to an unknown command");
            return;
        };

        let outcome = interpret(result);
        debug!(
            command = slot.name,
            command_id,
            elapsed_ms = slot.issued_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Command result"
        );
        self.record(&outcome);
        let _ = slot.tx.send(outcome);
    }

    /// Fail every pending command and refuse new ones.
    pub fn fail_all(&self) {
        let slots: Vec<(i64, Slot)> = {
            let mut table = lock(&self.pending);
            table.closed = true;
            table.slots.drain().collect()
        };
        if !slots.is_empty() {
            debug!(count = slots.len(), "Failing pending commands");
        }
        for (command_id, slot) in slots {
            debug!(command = slot.name, command_id, "Command abandoned");
            self.connection.counters().command_failed();
            let _ = slot.tx.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).slots.len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn complete(&self, id: i64, outcome: Outcome) {
        let slot = lock(&self.pending).slots.remove(&id);
        if let Some(slot) = slot {
            self.record(&outcome);
            let _ = slot.tx.send(outcome);
        }
    }

    /// Drop the slot for `id`. True if it was still pending.
    fn reclaim(&self, id: i64) -> bool {
        lock(&self.pending).slots.remove(&id).is_some()
    }

    fn record(&self, outcome: &Outcome) {
        let metrics = self.connection.counters();
        if outcome.is_ok() {
            metrics.command_succeeded();
        } else {
            metrics.command_failed();
        }
    }
}

/// Turn a raw `result` value into the caller's outcome.
fn interpret(result: &Value) -> Outcome {
    let Some(map) = result.as_dict() else {
        return Err(ProtocolError::InvalidResponse(format!(
            "{} (result is {})",
            constants::ERR_INVALID_RESPONSE,
            result.kind_name()
        )));
    };

    let status = map
        .get(&b"status"[..])
        .and_then(Value::as_bytes)
        .map(|s| s.as_ref())
        .unwrap_or(b"fail");
    if status != STATUS_OK {
        let msg = map
            .get(&b"msg"[..])
            .and_then(Value::as_bytes)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        return Err(ProtocolError::CommandFail(format!(
            "{}; {}",
            String::from_utf8_lossy(status),
            msg
        )));
    }
    Ok(map.clone())
}

/// Awaitable handle for one issued command.
///
/// Dropping the handle before completion reclaims the command id.
pub struct CommandResult {
    id: i64,
    name: &'static str,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandResult({}, id={})", self.name, self.id)
    }
}

impl CommandResult {
    fn new(
        id: i64,
        name: &'static str,
        rx: oneshot::Receiver<Outcome>,
        correlator: &Arc<Correlator>,
    ) -> Self {
        Self {
            id,
            name,
            rx,
            correlator: Arc::clone(correlator),
        }
    }

    /// Command id; 0 if the command was refused before an id was assigned
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait up to `timeout` for the result.
    pub async fn get(mut self, timeout: Duration) -> Result<Dict> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                if self.correlator.reclaim(self.id) {
                    self.correlator.connection.counters().command_timed_out();
                    warn!(command = self.name, command_id = self.id, "Command timed out");
                    return Err(ProtocolError::CommandTimeout(format!(
                        "{} (id {}) {}",
                        self.name,
                        self.id,
                        constants::ERR_COMMAND_TIMEOUT
                    )));
                }
                // Completed while the deadline fired; the sender is about to resolve
                (&mut self.rx)
                    .await
                    .unwrap_or(Err(ProtocolError::ConnectionClosed))
            }
        }
    }

    /// Wait with the correlator's default timeout.
    pub async fn wait(self) -> Result<Dict> {
        let timeout = self.correlator.default_timeout;
        self.get(timeout).await
    }
}

impl Drop for CommandResult {
    fn drop(&mut self) {
        self.correlator.reclaim(self.id);
    }
}
