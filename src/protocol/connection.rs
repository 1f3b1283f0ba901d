//! # Connection Engine
//!
//! Owns the session lifecycle on top of a [`Transport`]:
//!
//! ```text
//! disconnected --connect--> connecting --ready--> joined --(login)--> authenticating
//!                               |                   |                      |
//!                               |                   +----set_identity------+--> ready
//!                               v
//!                             closed <--teardown-- closing <--close / transport lost--
//! ```
//!
//! One worker task drains the transport's event feed. Inbound frames are
//! decoded and dispatched on that task, so handlers run one at a time.
//! `send` may be called from anywhere; it only enqueues to the transport.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{ClientConfig, CodecConfig};
use crate::core::bencode::CachingDecoder;
use crate::core::packet::{registry, Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::{Transport, TransportEvent, TransportSender};
use crate::utils::metrics::{Metrics, MetricsSnapshot};
use crate::utils::timeout::with_timeout_error;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Packets may be sent in these states
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ConnectionState::Joined | ConnectionState::Authenticating | ConnectionState::Ready
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Joined => "joined",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the session could not become (or stay) usable
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Connection(String),
    Auth(String),
}

type TeardownHook = Box<dyn FnOnce() + Send + 'static>;

/// Lock, recovering the guard from a poisoned mutex
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Connection {
    url: String,
    credentials: Option<(String, String)>,
    shutdown_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    identity: watch::Sender<Option<Bytes>>,
    failure: Mutex<Option<Failure>>,
    sender: Mutex<Option<TransportSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
    torn_down: AtomicBool,
    decoder: CachingDecoder,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(client: &ClientConfig, codec: &CodecConfig) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let unhandled_metrics = Arc::clone(&metrics);
        let dispatcher = Dispatcher::new().with_unhandled(move |packet| {
            unhandled_metrics.unhandled_packet();
            warn!(packet = packet.name(), tag = packet.tag(), "No handler for packet");
        });

        Arc::new(Self {
            url: client.url.clone(),
            credentials: client
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            shutdown_timeout: client.shutdown_timeout,
            state: watch::Sender::new(ConnectionState::Disconnected),
            identity: watch::Sender::new(None),
            failure: Mutex::new(None),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            teardown_hooks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            decoder: CachingDecoder::with_max_depth(
                codec.decode_cache_capacity,
                codec.decode_cache_threshold,
                codec.max_depth,
            ),
            dispatcher,
            metrics,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Handlers bound here run on the worker for every inbound packet.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        let cache = self.decoder.stats();
        snapshot.decode_cache_hits = cache.hits;
        snapshot.decode_cache_misses = cache.misses;
        snapshot
    }

    pub(crate) fn counters(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run `hook` once when the connection is torn down (immediately if it
    /// already has been).
    pub fn on_teardown<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = lock(&self.teardown_hooks);
        if self.torn_down.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!(from = %state, %to, "Connection state change");
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn record_failure(&self, failure: Failure) {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            *slot = Some(failure);
        }
        drop(slot);
        // Wake anyone blocked in await_ready
        self.state.send_modify(|_| {});
    }

    fn failure_error(&self) -> ProtocolError {
        match lock(&self.failure).clone() {
            Some(Failure::Connection(reason)) => ProtocolError::Connection(reason),
            Some(Failure::Auth(message)) => ProtocolError::AuthFailed(message),
            None => ProtocolError::Connection(constants::ERR_UNABLE_TO_CONNECT.to_string()),
        }
    }

    /// Open the transport and start the worker.
    #[instrument(skip(self, transport), fields(url = %self.url))]
    pub fn connect(self: &Arc<Self>, transport: &dyn Transport) -> Result<()> {
        if !self.transition(&[ConnectionState::Disconnected], ConnectionState::Connecting) {
            return Err(ProtocolError::Connection(format!(
                "cannot connect from state {}",
                self.state()
            )));
        }
        debug!("Connecting");

        let link = match transport.open(&self.url) {
            Ok(link) => link,
            Err(e) => {
                self.record_failure(Failure::Connection(e.to_string()));
                self.teardown();
                return Err(e);
            }
        };

        *lock(&self.sender) = Some(link.sender);
        let worker = tokio::spawn(Arc::clone(self).run(link.events));
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Ready => self.on_transport_ready(),
                TransportEvent::Binary(data) => self.on_frame(&data),
                TransportEvent::Rejected(reason) => {
                    warn!(url = %self.url, %reason, "Connection rejected");
                    self.record_failure(Failure::Connection(reason));
                    break;
                }
                TransportEvent::Disconnected { graceful, reason } => {
                    if graceful {
                        info!(url = %self.url, %reason, "Disconnected");
                    } else {
                        warn!(url = %self.url, %reason, "Connection lost");
                        self.record_failure(Failure::Connection(reason));
                    }
                    break;
                }
            }
        }
        self.teardown();
    }

    fn on_transport_ready(&self) {
        if !self.transition(&[ConnectionState::Connecting], ConnectionState::Joined) {
            return;
        }
        info!(url = %self.url, "Connected");

        if let Ok(join) = Packet::new(PacketType::RequestJoin, Vec::new()) {
            self.send(&join);
        }

        if let Some((username, password)) = &self.credentials {
            match Packet::new(
                PacketType::RequestLogin,
                vec![username.as_str().into(), password.as_str().into()],
            ) {
                Ok(login) => {
                    self.transition(&[ConnectionState::Joined], ConnectionState::Authenticating);
                    self.send(&login);
                }
                Err(e) => error!(error = %e, "Failed to build login packet"),
            }
        }
    }

    fn on_frame(&self, data: &Bytes) {
        self.metrics.frame_received(data.len() as u64);

        let packet = match registry().from_wire_cached(data, &self.decoder) {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.bad_frame();
                warn!(error = %e, bytes = data.len(), "Bad packet");
                return;
            }
        };

        if packet.is_quiet() {
            trace!("<- {packet:?}");
        } else {
            debug!("<- {packet:?}");
        }

        match self.dispatcher.dispatch(&packet) {
            Ok(()) => {}
            Err(ProtocolError::DispatcherClosed) => {
                debug!(packet = packet.name(), "Dispatcher closed; packet ignored");
            }
            Err(e) if e.is_packet_error() => {
                self.metrics.bad_frame();
                warn!(packet = ?packet, error = %e, "Packet failed to validate");
            }
            Err(e) => {
                self.metrics.handler_error();
                error!(packet = ?packet, error = %e, "Error calling handler");
            }
        }
    }

    /// Serialize and enqueue `packet`. Returns false (after logging) when
    /// the session is not running or the transport has gone away.
    pub fn send(&self, packet: &Packet) -> bool {
        if !self.state().is_running() {
            self.metrics.dropped_send();
            warn!(" -> {packet:?} (server gone)");
            return false;
        }

        let data = match packet.to_wire() {
            Ok(data) => data,
            Err(e) => {
                error!(packet = packet.name(), error = %e, "Failed to encode packet");
                return false;
            }
        };
        let len = data.len() as u64;

        let sent = match lock(&self.sender).as_ref() {
            Some(sender) => sender.send_binary(data).is_ok(),
            None => false,
        };
        if !sent {
            self.metrics.dropped_send();
            warn!(" -> {packet:?} (server gone)");
            return false;
        }

        self.metrics.frame_sent(len);
        if packet.is_quiet() {
            trace!(" -> {packet:?}");
        } else {
            debug!(" -> {packet:?}");
        }
        true
    }

    /// Block until the session is ready, the connection fails, or `timeout`.
    pub async fn await_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => {
                        return Err(self.failure_error())
                    }
                    _ => {}
                }
                if let Some(Failure::Auth(message)) = lock(&self.failure).clone() {
                    return Err(ProtocolError::AuthFailed(message));
                }
                if rx.changed().await.is_err() {
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        };
        with_timeout_error(wait, timeout, || {
            ProtocolError::Connection(constants::ERR_READY_TIMEOUT.to_string())
        })
        .await
    }

    /// Record the identity assigned by the server and mark the session ready.
    pub fn set_identity(&self, identity: Bytes) {
        info!(identity = %identity.escape_ascii(), "Identity assigned");
        self.identity.send_replace(Some(identity));
        self.transition(
            &[ConnectionState::Joined, ConnectionState::Authenticating],
            ConnectionState::Ready,
        );
    }

    /// The server rejected our credentials
    pub fn auth_failed(&self, message: &str) {
        warn!(%message, "Login failed");
        self.record_failure(Failure::Auth(message.to_string()));
    }

    /// The identity, if one has been assigned
    pub fn identity(&self) -> Option<Bytes> {
        self.identity.borrow().clone()
    }

    /// Wait up to `timeout` for the server-assigned identity.
    ///
    /// Returns `NoIdentity` early once the connection is closing.
    pub async fn get_identity(&self, timeout: Duration) -> Result<Bytes> {
        let mut identity_rx = self.identity.subscribe();
        let mut state_rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = identity_rx.borrow_and_update().clone();
                if let Some(identity) = current {
                    return Ok(identity);
                }
                if state_rx.borrow_and_update().is_terminal() {
                    return Err(ProtocolError::NoIdentity);
                }
                let changed = tokio::select! {
                    changed = identity_rx.changed() => changed,
                    changed = state_rx.changed() => changed,
                };
                if changed.is_err() {
                    return Err(ProtocolError::NoIdentity);
                }
            }
        };
        with_timeout_error(wait, timeout, || ProtocolError::NoIdentity).await
    }

    /// Send a polite `request_leave`; best effort.
    pub fn leave(&self) -> bool {
        match Packet::new(PacketType::RequestLeave, Vec::new()) {
            Ok(packet) => self.send(&packet),
            Err(_) => false,
        }
    }

    /// Graceful close: leave, close the transport, wait for the worker,
    /// then tear down. Safe to call more than once.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if self.state().is_running() {
            self.leave();
        }
        self.transition(
            &[
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Joined,
                ConnectionState::Authenticating,
                ConnectionState::Ready,
            ],
            ConnectionState::Closing,
        );
        if let Some(sender) = lock(&self.sender).as_ref() {
            sender.close();
        }

        let worker = lock(&self.worker).take();
        if let Some(mut handle) = worker {
            if tokio::time::timeout(self.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Worker did not stop in time; aborting"
                );
                handle.abort();
            }
        }
        self.teardown();
    }

    /// Immediate, non-async close for drop paths.
    pub fn abort(&self) {
        if let Some(sender) = lock(&self.sender).as_ref() {
            sender.close();
        }
        if let Some(handle) = lock(&self.worker).take() {
            handle.abort();
        }
        self.teardown();
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ConnectionState::Closing);
        self.dispatcher.close();
        if let Some(sender) = lock(&self.sender).as_ref() {
            sender.close();
        }

        let hooks = std::mem::take(&mut *lock(&self.teardown_hooks));
        for hook in hooks {
            hook();
        }

        self.state.send_replace(ConnectionState::Closed);
        info!(url = %self.url, "Connection closed");
    }
}
