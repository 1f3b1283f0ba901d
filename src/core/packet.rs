//! # Packet Model & Registry
//!
//! Every M2M message is a bencode list:
//!
//! ```text
//! [<int type tag>, <attr 1>, <attr 2>, ...]
//! ```
//!
//! Attributes follow the declared order of the packet's [`Schema`], never
//! their names. The [`Registry`] maps tags (and symbolic names) to schemas,
//! validates construction, and converts packets to and from wire bytes.
//!
//! The standard M2M catalogue is registered once, on first use of
//! [`registry()`]. Tags are stable; new packet types are additive only.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use once_cell::sync::Lazy;
use tracing::{error, trace};

use crate::core::bencode::{self, CachingDecoder, Value};
use crate::error::{constants, ProtocolError, Result};

/// Byte strings longer than this are shown as a length marker in debug output
pub const DEBUG_BYTES_LIMIT: usize = 64;

/// Attribute names that are never printed in cleartext
const SECRET_ATTRIBUTES: &[&str] = &["password"];

macro_rules! packet_types {
    ($( $(#[$meta:meta])* $variant:ident = $tag:literal => $name:literal, )*) => {
        /// Packet type tags of the M2M protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PacketType {
            $( $(#[$meta])* $variant = $tag, )*
        }

        impl PacketType {
            /// Every enumerated packet type, in tag order
            pub const ALL: &'static [PacketType] = &[$(PacketType::$variant,)*];

            pub const fn tag(self) -> u8 {
                self as u8
            }

            /// Symbolic snake_case name
            pub const fn name(self) -> &'static str {
                match self {
                    $(PacketType::$variant => $name,)*
                }
            }

            pub fn from_tag(tag: i64) -> Option<Self> {
                match tag {
                    $($tag => Some(PacketType::$variant),)*
                    _ => None,
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(PacketType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

packet_types! {
    /// Does nothing; reserved as a sentinel
    Null = 0 => "null",
    /// Client asks to join the server
    RequestJoin = 1 => "request_join",
    /// Client re-joins with a known identity
    RequestIdentify = 2 => "request_identify",
    /// Join or identify succeeded
    Welcome = 3 => "welcome",
    /// Textual information for developers
    Log = 4 => "log",
    RequestSend = 5 => "request_send",
    /// Incoming channel data
    Route = 6 => "route",
    Ping = 7 => "ping",
    Pong = 8 => "pong",
    /// Server assigns the client's identity
    SetIdentity = 9 => "set_identity",
    RequestOpen = 10 => "request_open",
    RequestClose = 11 => "request_close",
    RequestCloseAll = 12 => "request_close_all",
    KeepAlive = 13 => "keep_alive",
    NotifyOpen = 14 => "notify_open",
    RequestLogin = 15 => "request_login",
    /// Application-defined message outside any channel
    Instruction = 16 => "instruction",
    NotifyLoginSuccess = 17 => "notify_login_success",
    NotifyLoginFail = 18 => "notify_login_fail",
    NotifyClose = 19 => "notify_close",
    /// Polite disconnect
    RequestLeave = 20 => "request_leave",
    /// Out-of-band route control data
    RouteControl = 21 => "route_control",
    RequestSendControl = 22 => "request_send_control",
    /// Correlated answer to a command
    Response = 100 => "response",
    CommandAddRoute = 101 => "command_add_route",
    CommandSendInstruction = 102 => "command_send_instruction",
    CommandLog = 103 => "command_log",
    CommandBroadcastLog = 104 => "command_broadcast_log",
    CommandSetName = 106 => "command_set_name",
    CommandCheckNodes = 107 => "command_check_nodes",
    CommandGetIdentities = 108 => "command_get_identities",
    CommandSetAuth = 109 => "command_set_auth",
    CommandSetMeta = 110 => "command_set_meta",
    CommandGetMeta = 111 => "command_get_meta",
    PeerAddRoute = 200 => "peer_add_route",
    PeerForward = 201 => "peer_forward",
    PeerNotifyDisconnect = 202 => "peer_notify_disconnect",
    PeerNotifyName = 203 => "peer_notify_name",
}

impl PacketType {
    /// Command requests expect a correlated `response`
    pub fn is_command(self) -> bool {
        (101..=111).contains(&self.tag())
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PacketType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        PacketType::from_name(s)
            .ok_or_else(|| ProtocolError::UnknownPacketName(s.to_string()))
    }
}

/// Expected type of a packet attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Bytes,
    Int,
    List,
    Dict,
    /// Any bencode value; validated by whoever consumes it
    Any,
}

impl AttrKind {
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (AttrKind::Any, _)
                | (AttrKind::Bytes, Value::Bytes(_))
                | (AttrKind::Int, Value::Int(_))
                | (AttrKind::List, Value::List(_))
                | (AttrKind::Dict, Value::Dict(_))
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            AttrKind::Bytes => "bytes",
            AttrKind::Int => "int",
            AttrKind::List => "list",
            AttrKind::Dict => "dict",
            AttrKind::Any => "any",
        }
    }
}

/// A named, typed attribute slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub name: &'static str,
    pub kind: AttrKind,
}

const fn attr(name: &'static str, kind: AttrKind) -> Attribute {
    Attribute { name, kind }
}

/// Packet variant: tag, name and the ordered attribute list.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub tag: u8,
    pub name: &'static str,
    pub attributes: &'static [Attribute],
    /// Bulk or chatty traffic, logged at trace level only
    pub no_log: bool,
    /// Precomputed wire bytes for attribute-less hot-path packets
    pub wire: Option<&'static [u8]>,
}

impl Schema {
    pub const fn new(kind: PacketType, attributes: &'static [Attribute]) -> Self {
        Self::custom(kind.tag(), kind.name(), attributes)
    }

    /// Schema for a tag outside the standard catalogue
    pub const fn custom(tag: u8, name: &'static str, attributes: &'static [Attribute]) -> Self {
        Schema {
            tag,
            name,
            attributes,
            no_log: false,
            wire: None,
        }
    }

    /// Attribute-less packet with fixed wire bytes
    const fn fixed(kind: PacketType, wire: &'static [u8]) -> Self {
        Schema {
            wire: Some(wire),
            ..Self::new(kind, &[])
        }
    }

    const fn quiet(self) -> Self {
        Schema {
            no_log: true,
            ..self
        }
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }
}

use AttrKind::{Any, Bytes as B, Dict, Int, List};

/// The standard M2M packet catalogue.
///
/// `request_open` is enumerated by the protocol but carries no schema.
pub static M2M_SCHEMAS: &[Schema] = &[
    Schema::fixed(PacketType::Null, b"li0ee"),
    Schema::fixed(PacketType::RequestJoin, b"li1ee"),
    Schema::new(PacketType::RequestIdentify, &[attr("uuid", B)]),
    Schema::fixed(PacketType::Welcome, b"li3ee"),
    Schema::new(PacketType::Log, &[attr("text", B)]),
    Schema::new(PacketType::RequestSend, &[attr("channel", Int), attr("data", B)]).quiet(),
    Schema::new(PacketType::Route, &[attr("channel", Int), attr("data", B)]).quiet(),
    Schema::new(PacketType::Ping, &[attr("data", B)]).quiet(),
    Schema::new(PacketType::Pong, &[attr("data", B)]).quiet(),
    Schema::new(PacketType::SetIdentity, &[attr("uuid", B)]),
    Schema::new(PacketType::RequestClose, &[attr("port", Int)]),
    Schema::fixed(PacketType::RequestCloseAll, b"li12ee"),
    Schema::fixed(PacketType::KeepAlive, b"li13ee").quiet(),
    Schema::new(PacketType::NotifyOpen, &[attr("channel", Int)]),
    Schema::new(
        PacketType::RequestLogin,
        &[attr("username", B), attr("password", B)],
    ),
    Schema::new(PacketType::Instruction, &[attr("sender", B), attr("data", Dict)]),
    Schema::new(PacketType::NotifyLoginSuccess, &[attr("user", B)]),
    Schema::new(PacketType::NotifyLoginFail, &[attr("message", B)]),
    Schema::new(PacketType::NotifyClose, &[attr("port", Int)]),
    Schema::fixed(PacketType::RequestLeave, b"li20ee"),
    Schema::new(PacketType::RouteControl, &[attr("channel", Int), attr("data", B)]).quiet(),
    Schema::new(
        PacketType::RequestSendControl,
        &[attr("channel", Int), attr("data", B)],
    )
    .quiet(),
    Schema::new(PacketType::Response, &[attr("command_id", Int), attr("result", Any)]),
    Schema::new(
        PacketType::CommandAddRoute,
        &[
            attr("command_id", Int),
            attr("node1", B),
            attr("port1", Int),
            attr("node2", B),
            attr("port2", Int),
            attr("requester", B),
            attr("forwarded", Int),
        ],
    ),
    Schema::new(
        PacketType::CommandSendInstruction,
        &[attr("command_id", Int), attr("node", B), attr("data", Dict)],
    ),
    Schema::new(
        PacketType::CommandLog,
        &[attr("command_id", Int), attr("node", B), attr("text", B)],
    ),
    Schema::new(
        PacketType::CommandBroadcastLog,
        &[attr("command_id", Int), attr("text", B)],
    ),
    Schema::new(
        PacketType::CommandSetName,
        &[attr("command_id", Int), attr("node", B), attr("name", B)],
    ),
    Schema::new(
        PacketType::CommandCheckNodes,
        &[attr("command_id", Int), attr("nodes", List)],
    ),
    Schema::new(
        PacketType::CommandGetIdentities,
        &[attr("command_id", Int), attr("nodes", List)],
    ),
    Schema::new(
        PacketType::CommandSetAuth,
        &[attr("command_id", Int), attr("expire", Int), attr("value", B)],
    ),
    Schema::new(
        PacketType::CommandSetMeta,
        &[
            attr("command_id", Int),
            attr("requester", B),
            attr("node", B),
            attr("key", B),
            attr("value", B),
        ],
    ),
    Schema::new(
        PacketType::CommandGetMeta,
        &[attr("command_id", Int), attr("requester", B), attr("node", B)],
    ),
    Schema::new(
        PacketType::PeerAddRoute,
        &[
            attr("command_id", Int),
            attr("requester", B),
            attr("node1", B),
            attr("port1", Int),
            attr("node2", B),
            attr("port2", Int),
        ],
    ),
    Schema::new(PacketType::PeerForward, &[attr("recipient", B), attr("packet", B)]).quiet(),
    Schema::new(PacketType::PeerNotifyDisconnect, &[attr("node", B)]),
    Schema::new(PacketType::PeerNotifyName, &[attr("node", B), attr("name", B)]),
];

/// How a caller names a packet type: numeric tag or symbolic name.
#[derive(Debug, Clone, Copy)]
pub enum PacketKey<'a> {
    Tag(i64),
    Name(&'a str),
}

impl From<i64> for PacketKey<'_> {
    fn from(tag: i64) -> Self {
        PacketKey::Tag(tag)
    }
}

impl From<u8> for PacketKey<'_> {
    fn from(tag: u8) -> Self {
        PacketKey::Tag(i64::from(tag))
    }
}

impl From<PacketType> for PacketKey<'_> {
    fn from(kind: PacketType) -> Self {
        PacketKey::Tag(i64::from(kind.tag()))
    }
}

impl<'a> From<&'a str> for PacketKey<'a> {
    fn from(name: &'a str) -> Self {
        PacketKey::Name(name)
    }
}

/// One decoded or constructed packet. Immutable once built.
#[derive(Clone)]
pub struct Packet {
    schema: &'static Schema,
    values: Vec<Value>,
}

impl Packet {
    /// Build a standard packet from positional attribute values.
    pub fn new(kind: PacketType, values: Vec<Value>) -> Result<Self> {
        registry().construct(kind, values, Vec::new())
    }

    /// Build a standard packet from named attribute values.
    pub fn with_named(kind: PacketType, named: Vec<(&str, Value)>) -> Result<Self> {
        registry().construct(kind, Vec::new(), named)
    }

    pub fn tag(&self) -> u8 {
        self.schema.tag
    }

    /// The standard packet type, if the tag is one
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_tag(i64::from(self.schema.tag))
    }

    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn is_quiet(&self) -> bool {
        self.schema.no_log
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema
            .attribute_index(name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Attribute values in declared order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// (name, value) pairs in declared order
    pub fn attributes(&self) -> impl Iterator<Item = (&'static str, &Value)> + '_ {
        self.schema
            .attributes
            .iter()
            .map(|a| a.name)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Serialize as `[tag, attr1, attr2, ...]`.
    pub fn to_wire(&self) -> Result<Bytes> {
        if let Some(wire) = self.schema.wire {
            return Ok(Bytes::from_static(wire));
        }
        let mut items = Vec::with_capacity(self.values.len() + 1);
        items.push(Value::Int(i64::from(self.schema.tag)));
        items.extend(self.values.iter().cloned());
        bencode::encode(&Value::List(items)).map(Bytes::from)
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.schema.tag == other.schema.tag && self.values == other.values
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.schema.name)?;
        for (i, (name, value)) in self.attributes().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}=")?;
            if SECRET_ATTRIBUTES.contains(&name) {
                f.write_str("********")?;
                continue;
            }
            match value {
                Value::Bytes(b) if b.len() > DEBUG_BYTES_LIMIT => {
                    write!(f, "<{} bytes>", b.len())?
                }
                other => write!(f, "{other:?}")?,
            }
        }
        f.write_str(")")
    }
}

/// Tag/name → schema table.
#[derive(Debug, Default)]
pub struct Registry {
    by_tag: HashMap<u8, &'static Schema>,
    by_name: HashMap<&'static str, &'static Schema>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard M2M catalogue
    pub fn with_m2m_packets() -> Result<Self> {
        let mut registry = Self::new();
        for schema in M2M_SCHEMAS {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    /// Add a schema. Fails if its tag or name is already taken.
    pub fn register(&mut self, schema: &'static Schema) -> Result<()> {
        if let Some(existing) = self.by_tag.get(&schema.tag) {
            return Err(ProtocolError::Registration(format!(
                "packet type {} has been registered (by '{}')",
                schema.tag, existing.name
            )));
        }
        if self.by_name.contains_key(schema.name) {
            return Err(ProtocolError::Registration(format!(
                "packet name '{}' has been registered",
                schema.name
            )));
        }
        self.by_tag.insert(schema.tag, schema);
        self.by_name.insert(schema.name, schema);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    pub fn schemas(&self) -> impl Iterator<Item = &'static Schema> + '_ {
        self.by_tag.values().copied()
    }

    /// Resolve a tag or symbolic name.
    pub fn schema<'a>(&self, key: impl Into<PacketKey<'a>>) -> Result<&'static Schema> {
        match key.into() {
            PacketKey::Tag(tag) => u8::try_from(tag)
                .ok()
                .and_then(|t| self.by_tag.get(&t).copied())
                .ok_or(ProtocolError::UnknownPacket(tag)),
            PacketKey::Name(name) => self
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| ProtocolError::UnknownPacketName(name.to_string())),
        }
    }

    /// Construct a packet from positional values, then named values.
    ///
    /// Named values override positional ones. Every declared attribute must
    /// end up present and type-conformant.
    pub fn construct<'a>(
        &self,
        key: impl Into<PacketKey<'a>>,
        positional: Vec<Value>,
        named: Vec<(&str, Value)>,
    ) -> Result<Packet> {
        let schema = self.schema(key)?;
        let attributes = schema.attributes;

        if positional.len() > attributes.len() {
            return Err(ProtocolError::PacketFormat(format!(
                "{} takes {} attributes ({} given)",
                schema.name,
                attributes.len(),
                positional.len()
            )));
        }

        let mut slots: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
        slots.resize(attributes.len(), None);

        for (name, value) in named {
            let idx = schema.attribute_index(name).ok_or_else(|| {
                ProtocolError::PacketFormat(format!(
                    "{} has no attribute '{name}'",
                    schema.name
                ))
            })?;
            slots[idx] = Some(value);
        }

        let mut values = Vec::with_capacity(attributes.len());
        for (attribute, slot) in attributes.iter().zip(slots) {
            let value = slot.ok_or_else(|| {
                ProtocolError::PacketFormat(format!(
                    "missing attribute '{}', in {}",
                    attribute.name, schema.name
                ))
            })?;
            if !attribute.kind.accepts(&value) {
                return Err(ProtocolError::PacketFormat(format!(
                    "{} parameter '{}' should be a {} (not {})",
                    schema.name,
                    attribute.name,
                    attribute.kind.name(),
                    value.kind_name()
                )));
            }
            values.push(value);
        }

        Ok(Packet { schema, values })
    }

    /// Build a packet from an already decoded top-level value.
    pub fn from_value(&self, value: Value) -> Result<Packet> {
        let Value::List(items) = value else {
            return Err(ProtocolError::PacketFormat(constants::ERR_NOT_A_LIST.into()));
        };
        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(Value::Int(tag)) => tag,
            Some(_) => {
                return Err(ProtocolError::PacketFormat(
                    constants::ERR_TYPE_NOT_INT.into(),
                ))
            }
            None => return Err(ProtocolError::PacketFormat("empty packet".into())),
        };
        let schema = self.schema(tag)?;

        let mut body: Vec<Value> = items.collect();
        if body.len() > schema.attributes.len() {
            trace!(
                packet = schema.name,
                extra = body.len() - schema.attributes.len(),
                "Ignoring trailing packet values"
            );
            body.truncate(schema.attributes.len());
        }
        self.construct(tag, body, Vec::new())
    }

    /// Parse wire bytes into a packet.
    pub fn from_wire(&self, data: &[u8]) -> Result<Packet> {
        Self::check_list_marker(data)?;
        let value = bencode::decode(data).map_err(Self::badly_formatted)?;
        self.from_value(value)
    }

    /// Parse wire bytes, consulting a decode cache for short frames.
    pub fn from_wire_cached(&self, data: &[u8], decoder: &CachingDecoder) -> Result<Packet> {
        Self::check_list_marker(data)?;
        let value = decoder.decode(data).map_err(Self::badly_formatted)?;
        self.from_value(value)
    }

    fn check_list_marker(data: &[u8]) -> Result<()> {
        if data.first() != Some(&b'l') {
            return Err(ProtocolError::PacketFormat(constants::ERR_NOT_A_LIST.into()));
        }
        Ok(())
    }

    fn badly_formatted(err: ProtocolError) -> ProtocolError {
        match err {
            ProtocolError::Decode(msg) => {
                ProtocolError::PacketFormat(format!("packet is badly formatted ({msg})"))
            }
            other => other,
        }
    }
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::with_m2m_packets().unwrap_or_else(|e| {
        error!(error = %e, "Failed to register the standard packet catalogue");
        Registry::new()
    })
});

/// The process-wide registry of standard M2M packets.
pub fn registry() -> &'static Registry {
    &REGISTRY
}
