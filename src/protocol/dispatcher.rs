use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::warn;

use crate::core::bencode::{Dict, Value};
use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};

/// A handler argument after coercion
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    Text(String),
}

/// Converts a raw attribute into the form a handler expects
pub type Coercion = fn(Value) -> std::result::Result<Arg, String>;

/// Stock coercions for handler parameters.
pub mod coerce {
    use super::Arg;
    use crate::core::bencode::Value;

    /// UTF-8 text from a byte string
    pub fn text(value: Value) -> Result<Arg, String> {
        match value {
            Value::Bytes(b) => String::from_utf8(b.to_vec())
                .map(Arg::Text)
                .map_err(|e| format!("not valid UTF-8: {e}")),
            other => Err(format!("expected text, got {}", other.kind_name())),
        }
    }

    pub fn int(value: Value) -> Result<Arg, String> {
        match value {
            Value::Int(_) => Ok(Arg::Value(value)),
            other => Err(format!("expected int, got {}", other.kind_name())),
        }
    }

    pub fn bytes(value: Value) -> Result<Arg, String> {
        match value {
            Value::Bytes(_) => Ok(Arg::Value(value)),
            other => Err(format!("expected bytes, got {}", other.kind_name())),
        }
    }

    pub fn dict(value: Value) -> Result<Arg, String> {
        match value {
            Value::Dict(_) => Ok(Arg::Value(value)),
            other => Err(format!("expected dict, got {}", other.kind_name())),
        }
    }
}

/// Named, coerced arguments passed to a handler.
#[derive(Debug, Default)]
pub struct Args {
    values: HashMap<&'static str, Arg>,
}

impl Args {
    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.values.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.values.get(name)? {
            Arg::Value(v) => Some(v),
            Arg::Text(_) => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            Arg::Text(s) => Some(s),
            Arg::Value(v) => v.as_str(),
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        self.value(name).and_then(Value::as_bytes)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_int)
    }

    pub fn dict(&self, name: &str) -> Option<&Dict> {
        self.value(name).and_then(Value::as_dict)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type HandlerFn = dyn Fn(&Args) -> Result<()> + Send + Sync + 'static;

/// A handler plus its per-parameter coercion table.
pub struct Binding {
    handler: Box<HandlerFn>,
    coercions: Vec<(&'static str, Coercion)>,
}

impl Binding {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Args) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            coercions: Vec::new(),
        }
    }

    /// Apply `coercion` to attribute `name` before the handler runs.
    pub fn coerce(mut self, name: &'static str, coercion: Coercion) -> Self {
        self.coercions.push((name, coercion));
        self
    }

    fn prepare(&self, packet: &Packet) -> Result<Args> {
        let mut args = Args::default();
        for (name, value) in packet.attributes() {
            args.values.insert(name, Arg::Value(value.clone()));
        }
        for &(name, coercion) in &self.coercions {
            let Some(Arg::Value(raw)) = args.values.remove(&name) else {
                return Err(ProtocolError::PacketFormat(format!(
                    "{} has no attribute '{name}' to coerce",
                    packet.name()
                )));
            };
            let arg = coercion(raw).map_err(|e| {
                ProtocolError::PacketFormat(format!("{}: attribute '{name}' {e}", packet.name()))
            })?;
            args.values.insert(name, arg);
        }
        Ok(args)
    }
}

type UnhandledFn = dyn Fn(&Packet) + Send + Sync + 'static;

/// Routes decoded packets to handlers by type tag.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<u8, Binding>>>,
    unhandled: Box<UnhandledFn>,
    closed: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            unhandled: Box::new(|packet| {
                warn!(packet = packet.name(), tag = packet.tag(), "Unhandled packet");
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the hook run for packets with no bound handler.
    pub fn with_unhandled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.unhandled = Box::new(hook);
        self
    }

    pub fn register(&self, kind: PacketType, binding: Binding) -> Result<()> {
        self.register_tag(kind.tag(), binding)
    }

    pub fn register_tag(&self, tag: u8, binding: Binding) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::DispatcherClosed);
        }
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Handler(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(tag, binding);
        Ok(())
    }

    /// Run the handler bound to `packet`'s tag.
    ///
    /// Coercion failures surface as `PacketFormat` and skip the handler.
    /// Handler errors are returned unchanged.
    pub fn dispatch(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::DispatcherClosed);
        }

        let handlers = self.handlers.read().map_err(|_| {
            ProtocolError::Handler(constants::ERR_DISPATCHER_READ_LOCK.to_string())
        })?;

        match handlers.get(&packet.tag()) {
            None => {
                (self.unhandled)(packet);
                Ok(())
            }
            Some(binding) => {
                let args = binding.prepare(packet)?;
                (binding.handler)(&args)
            }
        }
    }

    pub fn is_registered(&self, kind: PacketType) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&kind.tag()))
            .unwrap_or(false)
    }

    /// Drop every binding. Later dispatches fail with `DispatcherClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        match self.handlers.write() {
            Ok(mut handlers) => handlers.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
