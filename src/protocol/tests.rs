// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::{ClientConfig, CodecConfig};
use crate::core::bencode::Value;
use crate::core::packet::{Packet, PacketType};
use crate::error::ProtocolError;
use crate::protocol::command::Correlator;
use crate::protocol::connection::{Connection, ConnectionState};
use crate::protocol::dispatcher::{coerce, Binding};
use crate::transport::memory::{pair, MemoryPeer, MemoryServer, MemoryTransport};

const WAIT: Duration = Duration::from_secs(2);

struct Session {
    connection: Arc<Connection>,
    correlator: Arc<Correlator>,
    peer: MemoryPeer,
    // Keeps the accept channel open for the session's lifetime
    _server: MemoryServer,
}

fn client_config(credentials: Option<(&str, &str)>) -> ClientConfig {
    ClientConfig {
        url: "memory://relay".to_string(),
        username: credentials.map(|(user, _)| user.to_string()),
        password: credentials.map(|(_, pass)| pass.to_string()),
        shutdown_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Bind the handlers the engine needs to reach the ready state and
/// correlate responses.
fn wire_up(connection: &Arc<Connection>, command_timeout: Duration) -> Arc<Correlator> {
    let correlator = Correlator::new(Arc::clone(connection), command_timeout);
    let dispatcher = connection.dispatcher();

    let weak: Weak<Connection> = Arc::downgrade(connection);
    dispatcher
        .register(
            PacketType::SetIdentity,
            Binding::new(move |args| {
                if let (Some(connection), Some(uuid)) = (weak.upgrade(), args.bytes("uuid")) {
                    connection.set_identity(uuid.clone());
                }
                Ok(())
            }),
        )
        .unwrap();

    let weak = Arc::downgrade(connection);
    dispatcher
        .register(
            PacketType::NotifyLoginFail,
            Binding::new(move |args| {
                let message = args.text("message").unwrap_or_default().to_string();
                if let Some(connection) = weak.upgrade() {
                    connection.auth_failed(&message);
                }
                Err(ProtocolError::AuthFailed(message))
            })
            .coerce("message", coerce::text),
        )
        .unwrap();

    let weak = Arc::downgrade(&correlator);
    dispatcher
        .register(
            PacketType::Response,
            Binding::new(move |args| {
                if let (Some(correlator), Some(id), Some(result)) =
                    (weak.upgrade(), args.int("command_id"), args.value("result"))
                {
                    correlator.handle_response(id, result);
                }
                Ok(())
            }),
        )
        .unwrap();

    correlator
}

async fn open(
    credentials: Option<(&str, &str)>,
) -> (Arc<Connection>, Arc<Correlator>, MemoryPeer, MemoryServer) {
    let (transport, mut server): (MemoryTransport, MemoryServer) = pair();
    let connection = Connection::new(&client_config(credentials), &CodecConfig::default());
    let correlator = wire_up(&connection, Duration::from_millis(200));
    connection.connect(&transport).unwrap();
    let peer = server.accept().await.unwrap();
    (connection, correlator, peer, server)
}

/// A session that has joined and received its identity.
async fn ready_session() -> Session {
    let (connection, correlator, mut peer, server) = open(None).await;
    peer.ready();

    let join = peer.recv().await.unwrap().unwrap();
    assert_eq!(join.packet_type(), Some(PacketType::RequestJoin));

    peer.send(&Packet::new(PacketType::SetIdentity, vec!["node-1".into()]).unwrap())
        .unwrap();
    connection.await_ready(WAIT).await.unwrap();

    Session {
        connection,
        correlator,
        peer,
        _server: server,
    }
}

fn respond(peer: &MemoryPeer, command_id: i64, result: Value) {
    peer.send(&Packet::new(PacketType::Response, vec![command_id.into(), result]).unwrap())
        .unwrap();
}

/// Answer the server side until the client closes its end.
fn drain(mut peer: MemoryPeer) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { while peer.recv_raw().await.is_some() {} })
}

async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn broadcast(correlator: &Arc<Correlator>, text: &str) -> crate::protocol::command::CommandResult {
    correlator.issue(PacketType::CommandBroadcastLog, vec![("text", text.into())])
}

#[tokio::test]
async fn test_session_reaches_ready_with_identity() {
    let session = ready_session().await;
    assert_eq!(session.connection.state(), ConnectionState::Ready);
    assert_eq!(
        session.connection.identity().as_deref(),
        Some(&b"node-1"[..])
    );
    let identity = session.connection.get_identity(WAIT).await.unwrap();
    assert_eq!(&identity[..], b"node-1");
}

#[tokio::test]
async fn test_command_ids_strictly_increase() {
    let mut session = ready_session().await;

    let handles: Vec<_> = (0..3)
        .map(|i| broadcast(&session.correlator, &format!("message {i}")))
        .collect();
    let ids: Vec<i64> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    for expected in 1..=3 {
        let packet = session.peer.recv().await.unwrap().unwrap();
        assert_eq!(packet.packet_type(), Some(PacketType::CommandBroadcastLog));
        assert_eq!(packet.get("command_id"), Some(&Value::Int(expected)));
    }
    assert_eq!(session.correlator.pending_count(), 3);
}

#[tokio::test]
async fn test_command_success_resolves_mapping() {
    let mut session = ready_session().await;

    let handle = broadcast(&session.correlator, "hello");
    let packet = session.peer.recv().await.unwrap().unwrap();
    let id = packet.get("command_id").and_then(Value::as_int).unwrap();
    respond(
        &session.peer,
        id,
        Value::dict([("status", Value::from("ok")), ("count", Value::from(2))]),
    );

    let result = handle.get(WAIT).await.unwrap();
    assert_eq!(result.get(&b"count"[..]), Some(&Value::Int(2)));
    assert_eq!(session.correlator.pending_count(), 0);
    assert_eq!(session.connection.metrics().commands_succeeded, 1);
}

#[tokio::test]
async fn test_command_failure_carries_status_and_message() {
    let mut session = ready_session().await;

    let handle = broadcast(&session.correlator, "hello");
    let packet = session.peer.recv().await.unwrap().unwrap();
    let id = packet.get("command_id").and_then(Value::as_int).unwrap();
    respond(
        &session.peer,
        id,
        Value::dict([("status", "fail"), ("msg", "node not found")]),
    );

    match handle.get(WAIT).await {
        Err(ProtocolError::CommandFail(msg)) => assert_eq!(msg, "fail; node not found"),
        other => panic!("expected CommandFail, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_mapping_result_is_invalid_response() {
    let mut session = ready_session().await;

    let handle = broadcast(&session.correlator, "hello");
    let packet = session.peer.recv().await.unwrap().unwrap();
    let id = packet.get("command_id").and_then(Value::as_int).unwrap();
    respond(&session.peer, id, Value::from("ok"));

    assert!(matches!(
        handle.get(WAIT).await,
        Err(ProtocolError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_timed_out_command_is_reclaimed() {
    let mut session = ready_session().await;

    let handle = broadcast(&session.correlator, "hello");
    let id = handle.id();
    let _ = session.peer.recv().await.unwrap().unwrap();

    let err = handle.get(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::CommandTimeout(_)));
    assert!(err.to_string().contains("command_broadcast_log"));
    assert_eq!(session.correlator.pending_count(), 0);

    // A late answer is an orphan and changes nothing
    respond(&session.peer, id, Value::dict([("status", "ok")]));
    let connection = Arc::clone(&session.connection);
    eventually(|| connection.metrics().orphan_responses == 1).await;
    assert_eq!(session.connection.metrics().commands_timed_out, 1);
    assert_eq!(session.connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_wait_uses_default_timeout() {
    let session = ready_session().await;
    let handle = broadcast(&session.correlator, "hello");
    assert!(matches!(
        handle.wait().await,
        Err(ProtocolError::CommandTimeout(_))
    ));
}

#[tokio::test]
async fn test_dropped_handle_releases_slot() {
    let session = ready_session().await;
    let handle = broadcast(&session.correlator, "hello");
    assert_eq!(session.correlator.pending_count(), 1);
    drop(handle);
    assert_eq!(session.correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_close_fails_every_pending_command() {
    let session = ready_session().await;
    let Session {
        connection,
        correlator,
        peer,
        _server,
    } = session;

    let handles: Vec<_> = (0..4).map(|i| broadcast(&correlator, &i.to_string())).collect();
    let server_side = drain(peer);

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    for handle in handles {
        assert!(matches!(
            handle.get(WAIT).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }
    assert_eq!(correlator.pending_count(), 0);

    // New commands are refused without touching the wire
    let late = broadcast(&correlator, "late");
    assert!(matches!(
        late.get(WAIT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    server_side.await.unwrap();
}

#[tokio::test]
async fn test_bad_frame_does_not_end_session() {
    let mut session = ready_session().await;

    session.peer.send_raw(&b"this is not bencode"[..]).unwrap();
    session.peer.send_raw(&b"l3:fooe"[..]).unwrap();
    let connection = Arc::clone(&session.connection);
    eventually(|| connection.metrics().bad_frames == 2).await;
    assert_eq!(session.connection.state(), ConnectionState::Ready);

    let handle = broadcast(&session.correlator, "still here");
    let packet = session.peer.recv().await.unwrap().unwrap();
    let id = packet.get("command_id").and_then(Value::as_int).unwrap();
    respond(&session.peer, id, Value::dict([("status", "ok")]));
    assert!(handle.get(WAIT).await.is_ok());
}

#[tokio::test]
async fn test_unknown_packet_is_counted_not_fatal() {
    let session = ready_session().await;

    // keep_alive has no handler bound
    session.peer.send_raw(&b"li13ee"[..]).unwrap();
    let connection = Arc::clone(&session.connection);
    eventually(|| connection.metrics().unhandled_packets == 1).await;
    assert_eq!(session.connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_login_is_sent_after_join() {
    let (connection, _correlator, mut peer, _server) = open(Some(("admin", "secret"))).await;
    peer.ready();

    let join = peer.recv().await.unwrap().unwrap();
    assert_eq!(join.packet_type(), Some(PacketType::RequestJoin));
    let login = peer.recv().await.unwrap().unwrap();
    assert_eq!(login.packet_type(), Some(PacketType::RequestLogin));
    assert_eq!(login.get("username"), Some(&Value::from("admin")));
    assert_eq!(login.get("password"), Some(&Value::from("secret")));
    assert_eq!(connection.state(), ConnectionState::Authenticating);

    peer.send(&Packet::new(PacketType::SetIdentity, vec!["node-9".into()]).unwrap())
        .unwrap();
    connection.await_ready(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_login_failure_fails_await_ready() {
    let (connection, _correlator, mut peer, _server) = open(Some(("admin", "wrong"))).await;
    peer.ready();
    let _join = peer.recv().await.unwrap().unwrap();
    let _login = peer.recv().await.unwrap().unwrap();

    peer.send(&Packet::new(PacketType::NotifyLoginFail, vec!["bad password".into()]).unwrap())
        .unwrap();

    match connection.await_ready(WAIT).await {
        Err(ProtocolError::AuthFailed(message)) => assert_eq!(message, "bad password"),
        other => panic!("expected AuthFailed, got {other:?}"),
    }
    // The handler's error is logged, the session stays up until closed
    assert_eq!(connection.metrics().handler_errors, 1);
}

#[tokio::test]
async fn test_rejected_transport_fails_await_ready() {
    let (connection, _correlator, peer, _server) = open(None).await;
    peer.reject("connection refused");

    match connection.await_ready(WAIT).await {
        Err(ProtocolError::Connection(reason)) => assert_eq!(reason, "connection refused"),
        other => panic!("expected Connection error, got {other:?}"),
    }
    let connection2 = Arc::clone(&connection);
    eventually(|| connection2.state() == ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_server_disconnect_tears_down() {
    let session = ready_session().await;
    let handle = broadcast(&session.correlator, "hello");
    session.peer.disconnect(false, "relay restarted");

    assert!(matches!(
        handle.get(WAIT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    let connection = Arc::clone(&session.connection);
    eventually(|| connection.state() == ConnectionState::Closed).await;
    assert!(session.connection.dispatcher().is_closed());
}

#[tokio::test]
async fn test_send_after_close_returns_false() {
    let session = ready_session().await;
    let connection = Arc::clone(&session.connection);
    let server_side = drain(session.peer);

    connection.close().await;
    let ping = Packet::new(PacketType::Ping, vec!["x".into()]).unwrap();
    assert!(!connection.send(&ping));
    assert!(!connection.leave());
    assert!(connection.metrics().dropped_sends >= 1);
    server_side.await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let session = ready_session().await;
    let connection = Arc::clone(&session.connection);
    let server_side = drain(session.peer);

    connection.close().await;
    connection.close().await;
    connection.abort();
    assert_eq!(connection.state(), ConnectionState::Closed);
    server_side.await.unwrap();
}

#[tokio::test]
async fn test_close_sends_leave() {
    let mut session = ready_session().await;
    let connection = Arc::clone(&session.connection);

    let closing = tokio::spawn(async move { connection.close().await });
    let leave = session.peer.recv().await.unwrap().unwrap();
    assert_eq!(leave.packet_type(), Some(PacketType::RequestLeave));
    assert!(session.peer.recv().await.is_none());
    closing.await.unwrap();
}

#[tokio::test]
async fn test_get_identity_gives_up_on_close() {
    let (connection, _correlator, mut peer, _server) = open(None).await;
    peer.ready();
    let _join = peer.recv().await.unwrap().unwrap();

    let waiter = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.get_identity(WAIT).await })
    };
    let server_side = drain(peer);
    connection.close().await;

    assert!(matches!(
        waiter.await.unwrap(),
        Err(ProtocolError::NoIdentity)
    ));
    server_side.await.unwrap();
}

#[tokio::test]
async fn test_get_identity_times_out() {
    let (connection, _correlator, mut peer, _server) = open(None).await;
    peer.ready();
    let _join = peer.recv().await.unwrap().unwrap();

    assert!(matches!(
        connection.get_identity(Duration::from_millis(20)).await,
        Err(ProtocolError::NoIdentity)
    ));
}

#[tokio::test]
async fn test_connect_twice_is_refused() {
    let session = ready_session().await;
    let (transport, _server) = pair();
    assert!(matches!(
        session.connection.connect(&transport),
        Err(ProtocolError::Connection(_))
    ));
}
