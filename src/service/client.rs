//! # Client Facade
//!
//! [`Client`] wires a [`Connection`] and a [`Correlator`] together, binds the
//! protocol handlers, performs the join/login handshake and exposes the relay
//! commands as typed methods.
//!
//! ```no_run
//! # async fn demo() -> m2m_client::Result<()> {
//! use m2m_client::{Client, M2mConfig};
//!
//! let config = M2mConfig::default();
//! let client = Client::connect_url(&config).await?;
//! client.log("Hello, World").wait().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Traffic the facade does not consume itself (instructions, routed data,
//! channel notifications) is queued for [`Client::inbound`]. The queue holds
//! at most `inbound_capacity` events; overflow is dropped and counted in
//! `dropped_inbound`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, M2mConfig};
use crate::core::bencode::{Dict, Value};
use crate::core::packet::{Packet, PacketType};
use crate::error::{ProtocolError, Result};
use crate::protocol::command::{CommandResult, Correlator};
use crate::protocol::connection::{Connection, ConnectionState};
use crate::protocol::dispatcher::{coerce, Args, Binding};
use crate::transport::{self, Transport};
use crate::utils::metrics::{MetricsSnapshot, Timer};

/// Port value asking the relay to pick one
const ANY_PORT: i64 = -1;

/// Server traffic handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Another node sent us an instruction
    Instruction { sender: Bytes, data: Dict },
    /// Data routed to us on `channel`
    Route { channel: i64, data: Bytes },
    /// Control data routed to us on `channel`
    RouteControl { channel: i64, data: Bytes },
    /// A channel was opened to this node
    ChannelOpened { channel: i64 },
    /// The server closed `port`
    ChannelClosed { port: i64 },
}

fn byte_string(value: impl AsRef<[u8]>) -> Value {
    Value::Bytes(Bytes::copy_from_slice(value.as_ref()))
}

fn node_list<I>(nodes: I) -> Value
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    Value::List(nodes.into_iter().map(byte_string).collect())
}

fn required<T>(value: Option<T>, packet: PacketType, name: &str) -> Result<T> {
    value.ok_or_else(|| {
        ProtocolError::PacketFormat(format!("{} is missing '{name}'", packet.name()))
    })
}

pub struct Client {
    config: ClientConfig,
    connection: Arc<Connection>,
    correlator: Arc<Correlator>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.config.url)
            .field("state", &self.connection.state())
            .field("identity", &self.connection.identity())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect over the transport matching the configured URL scheme.
    pub async fn connect_url(config: &M2mConfig) -> Result<Self> {
        let transport = transport::for_url(&config.client.url)?;
        Self::connect(config, transport.as_ref()).await
    }

    /// Connect over `transport` and wait until the session is ready.
    ///
    /// Fails with `AuthFailed` if the server rejects the credentials and
    /// with `Connection` if the transport fails or the session is not ready
    /// within `connect_timeout`.
    #[instrument(skip(config, transport), fields(url = %config.client.url))]
    pub async fn connect(config: &M2mConfig, transport: &dyn Transport) -> Result<Self> {
        config.validate_strict()?;
        let _timer = Timer::start("connect");

        let connection = Connection::new(&config.client, &config.codec);
        let correlator = Correlator::new(Arc::clone(&connection), config.client.command_timeout);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.client.inbound_capacity);
        bind_handlers(&connection, &correlator, inbound_tx)?;

        let client = Self {
            config: config.client.clone(),
            connection,
            correlator,
            inbound: Mutex::new(Some(inbound_rx)),
        };

        client.connection.connect(transport)?;
        if let Err(e) = client
            .connection
            .await_ready(config.client.connect_timeout)
            .await
        {
            client.close().await;
            return Err(e);
        }

        info!(
            identity = ?client.connection.identity().map(|id| id.escape_ascii().to_string()),
            "Client ready"
        );
        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.connection.metrics()
    }

    /// The identity assigned by the server, if any yet
    pub fn identity(&self) -> Option<Bytes> {
        self.connection.identity()
    }

    /// Wait for the identity with the configured identity timeout.
    pub async fn get_identity(&self) -> Result<Bytes> {
        self.connection
            .get_identity(self.config.identity_timeout)
            .await
    }

    pub async fn get_identity_timeout(&self, timeout: Duration) -> Result<Bytes> {
        self.connection.get_identity(timeout).await
    }

    /// Stream of server traffic the facade does not consume.
    ///
    /// Can be taken once; later calls return `None`. Events that arrive
    /// while the queue is full are dropped.
    pub fn inbound(&self) -> Option<ReceiverStream<Inbound>> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .map(ReceiverStream::new)
    }

    /// Broadcast a log line to the relay.
    pub fn log(&self, text: &str) -> CommandResult {
        self.correlator
            .issue(PacketType::CommandBroadcastLog, vec![("text", text.into())])
    }

    /// Log a line against one node.
    pub fn command_log(&self, node_id: impl AsRef<[u8]>, text: &str) -> CommandResult {
        self.correlator.issue(
            PacketType::CommandLog,
            vec![("node", byte_string(node_id)), ("text", text.into())],
        )
    }

    /// Route `node1` to `node2`, letting the relay pick both ports.
    pub async fn add_route(
        &self,
        node1: impl AsRef<[u8]>,
        node2: impl AsRef<[u8]>,
    ) -> Result<CommandResult> {
        let identity = self.get_identity().await?;
        Ok(self.correlator.issue(
            PacketType::CommandAddRoute,
            vec![
                ("node1", byte_string(node1)),
                ("port1", ANY_PORT.into()),
                ("node2", byte_string(node2)),
                ("port2", ANY_PORT.into()),
                ("requester", Value::Bytes(identity)),
                ("forwarded", Value::Int(0)),
            ],
        ))
    }

    pub fn send_instruction(&self, node_id: impl AsRef<[u8]>, data: Dict) -> CommandResult {
        self.correlator.issue(
            PacketType::CommandSendInstruction,
            vec![("node", byte_string(node_id)), ("data", Value::Dict(data))],
        )
    }

    /// Associate a node with a human readable name.
    pub fn name_node(&self, node_id: impl AsRef<[u8]>, name: &str) -> CommandResult {
        self.correlator.issue(
            PacketType::CommandSetName,
            vec![("node", byte_string(node_id)), ("name", name.into())],
        )
    }

    pub fn get_identities<I>(&self, nodes: I) -> CommandResult
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.correlator.issue(
            PacketType::CommandGetIdentities,
            vec![("nodes", node_list(nodes))],
        )
    }

    /// Ask which of `nodes` are online.
    pub fn check_nodes<I>(&self, nodes: I) -> CommandResult
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.correlator.issue(
            PacketType::CommandCheckNodes,
            vec![("nodes", node_list(nodes))],
        )
    }

    pub fn set_auth(&self, expire: i64, value: impl AsRef<[u8]>) -> CommandResult {
        self.correlator.issue(
            PacketType::CommandSetAuth,
            vec![("expire", expire.into()), ("value", byte_string(value))],
        )
    }

    pub async fn set_meta(
        &self,
        device: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<CommandResult> {
        let identity = self.get_identity().await?;
        Ok(self.correlator.issue(
            PacketType::CommandSetMeta,
            vec![
                ("requester", Value::Bytes(identity)),
                ("node", byte_string(device)),
                ("key", byte_string(key)),
                ("value", byte_string(value)),
            ],
        ))
    }

    pub async fn get_meta(&self, device: impl AsRef<[u8]>) -> Result<CommandResult> {
        let identity = self.get_identity().await?;
        Ok(self.correlator.issue(
            PacketType::CommandGetMeta,
            vec![("requester", Value::Bytes(identity)), ("node", byte_string(device))],
        ))
    }

    /// Send `request_leave`; best effort.
    pub fn leave(&self) -> bool {
        self.connection.leave()
    }

    /// Leave, close the transport and fail anything still pending.
    pub async fn close(&self) {
        self.connection.close().await;
        self.connection.metrics().log();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.connection.state() != ConnectionState::Closed {
            debug!(url = %self.config.url, "Client dropped while open; aborting");
            self.connection.abort();
        }
    }
}

/// Bind the facade's packet handlers. Handlers hold weak references so the
/// dispatcher never keeps its own connection alive.
fn bind_handlers(
    connection: &Arc<Connection>,
    correlator: &Arc<Correlator>,
    inbound: mpsc::Sender<Inbound>,
) -> Result<()> {
    let dispatcher = connection.dispatcher();

    let weak = Arc::downgrade(connection);
    dispatcher.register(
        PacketType::SetIdentity,
        Binding::new(move |args| {
            let uuid = required(args.bytes("uuid"), PacketType::SetIdentity, "uuid")?;
            if let Some(connection) = weak.upgrade() {
                connection.set_identity(uuid.clone());
            }
            Ok(())
        }),
    )?;

    dispatcher.register(
        PacketType::Welcome,
        Binding::new(|_| {
            debug!("Welcome received; channels may be opened");
            Ok(())
        }),
    )?;

    dispatcher.register(
        PacketType::NotifyLoginSuccess,
        Binding::new(|args| {
            info!(user = args.text("user").unwrap_or_default(), "Logged in");
            Ok(())
        })
        .coerce("user", coerce::text),
    )?;

    let weak = Arc::downgrade(connection);
    dispatcher.register(
        PacketType::NotifyLoginFail,
        Binding::new(move |args| {
            let message = args.text("message").unwrap_or_default().to_string();
            if let Some(connection) = weak.upgrade() {
                connection.auth_failed(&message);
            }
            Err(ProtocolError::AuthFailed(message))
        })
        .coerce("message", coerce::text),
    )?;

    dispatcher.register(
        PacketType::Log,
        Binding::new(|args| {
            info!("[log] {}", args.text("text").unwrap_or_default());
            Ok(())
        })
        .coerce("text", coerce::text),
    )?;

    let weak = Arc::downgrade(connection);
    dispatcher.register(
        PacketType::Ping,
        Binding::new(move |args| {
            let data = required(args.bytes("data"), PacketType::Ping, "data")?;
            if let Some(connection) = weak.upgrade() {
                let pong = Packet::new(PacketType::Pong, vec![data.clone().into()])?;
                connection.send(&pong);
            }
            Ok(())
        }),
    )?;

    let weak = Arc::downgrade(correlator);
    dispatcher.register(
        PacketType::Response,
        Binding::new(move |args| {
            let command_id = required(args.int("command_id"), PacketType::Response, "command_id")?;
            let result = required(args.value("result"), PacketType::Response, "result")?;
            if let Some(correlator) = weak.upgrade() {
                correlator.handle_response(command_id, result);
            }
            Ok(())
        }),
    )?;

    forward(connection, &inbound, PacketType::Instruction, |args| {
        Ok(Inbound::Instruction {
            sender: required(args.bytes("sender"), PacketType::Instruction, "sender")?.clone(),
            data: required(args.dict("data"), PacketType::Instruction, "data")?.clone(),
        })
    })?;

    forward(connection, &inbound, PacketType::Route, |args| {
        Ok(Inbound::Route {
            channel: required(args.int("channel"), PacketType::Route, "channel")?,
            data: required(args.bytes("data"), PacketType::Route, "data")?.clone(),
        })
    })?;

    forward(connection, &inbound, PacketType::RouteControl, |args| {
        Ok(Inbound::RouteControl {
            channel: required(args.int("channel"), PacketType::RouteControl, "channel")?,
            data: required(args.bytes("data"), PacketType::RouteControl, "data")?.clone(),
        })
    })?;

    forward(connection, &inbound, PacketType::NotifyOpen, |args| {
        Ok(Inbound::ChannelOpened {
            channel: required(args.int("channel"), PacketType::NotifyOpen, "channel")?,
        })
    })?;

    forward(connection, &inbound, PacketType::NotifyClose, |args| {
        Ok(Inbound::ChannelClosed {
            port: required(args.int("port"), PacketType::NotifyClose, "port")?,
        })
    })?;

    Ok(())
}

/// Bind `kind` to a handler that converts the packet and queues it for the
/// application. Nobody listening is not an error; a full queue drops the event.
fn forward<F>(
    connection: &Connection,
    inbound: &mpsc::Sender<Inbound>,
    kind: PacketType,
    convert: F,
) -> Result<()>
where
    F: Fn(&Args) -> Result<Inbound> + Send + Sync + 'static,
{
    let tx = inbound.clone();
    let metrics = Arc::clone(connection.counters());
    connection.dispatcher().register(
        kind,
        Binding::new(move |args| {
            let event = convert(args)?;
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics.inbound_dropped();
                    warn!(packet = kind.name(), "Inbound queue full; event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(packet = kind.name(), "Inbound receiver dropped");
                }
            }
            Ok(())
        }),
    )
}
