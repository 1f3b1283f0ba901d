#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end client tests against a scripted in-memory relay.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use m2m_client::core::bencode::Value;
use m2m_client::core::packet::{Packet, PacketType};
use m2m_client::transport::memory::{pair, MemoryPeer, MemoryServer};
use m2m_client::{Client, ConnectionState, Inbound, M2mConfig, ProtocolError};
use tokio::sync::mpsc;

const IDENTITY: &str = "relay-node-7";
const WAIT: Duration = Duration::from_secs(2);

fn config(credentials: Option<(&str, &str)>) -> M2mConfig {
    M2mConfig::default_with_overrides(|c| {
        c.client.url = "ws://relay.test/m2m/".to_string();
        c.client.username = credentials.map(|(user, _)| user.to_string());
        c.client.password = credentials.map(|(_, pass)| pass.to_string());
        c.client.connect_timeout = WAIT;
        c.client.command_timeout = Duration::from_secs(1);
        c.client.identity_timeout = Duration::from_secs(1);
        c.client.shutdown_timeout = Duration::from_secs(1);
    })
}

/// Handle on a relay task: packets it received, and a way to push packets
struct Relay {
    seen: mpsc::UnboundedReceiver<Packet>,
    push: mpsc::UnboundedSender<Packet>,
}

impl Relay {
    async fn next_of(&mut self, kind: PacketType) -> Packet {
        loop {
            let packet = tokio::time::timeout(WAIT, self.seen.recv())
                .await
                .expect("relay saw nothing in time")
                .expect("relay stopped");
            if packet.packet_type() == Some(kind) {
                return packet;
            }
        }
    }

    fn push(&self, packet: Packet) {
        self.push.send(packet).unwrap();
    }
}

fn reply(peer: &MemoryPeer, kind: PacketType, values: Vec<Value>) {
    peer.send(&Packet::new(kind, values).unwrap()).unwrap();
}

/// What a well-behaved relay does with one client packet.
fn answer(peer: &MemoryPeer, packet: &Packet, password: Option<&str>) {
    let Some(kind) = packet.packet_type() else {
        return;
    };
    match kind {
        PacketType::RequestJoin => {
            reply(peer, PacketType::Welcome, vec![]);
            if password.is_none() {
                reply(peer, PacketType::SetIdentity, vec![IDENTITY.into()]);
            }
        }
        PacketType::RequestLogin => {
            let user = packet.get("username").cloned().unwrap();
            let given = packet.get("password").and_then(Value::as_str);
            if given == password {
                reply(peer, PacketType::NotifyLoginSuccess, vec![user]);
                reply(peer, PacketType::SetIdentity, vec![IDENTITY.into()]);
            } else {
                reply(
                    peer,
                    PacketType::NotifyLoginFail,
                    vec!["invalid username or password".into()],
                );
            }
        }
        // Never answered, so callers can observe teardown
        PacketType::CommandCheckNodes => {}
        PacketType::CommandGetMeta
            if packet.get("node") == Some(&Value::from("missing")) =>
        {
            let id = packet.get("command_id").cloned().unwrap();
            let result = Value::dict([("status", "fail"), ("msg", "no such device")]);
            reply(peer, PacketType::Response, vec![id, result]);
        }
        kind if kind.is_command() => {
            let id = packet.get("command_id").cloned().unwrap();
            let result = Value::dict([
                ("status", Value::from("ok")),
                ("command", Value::from(kind.name())),
            ]);
            reply(peer, PacketType::Response, vec![id, result]);
        }
        _ => {}
    }
}

fn spawn_relay(mut server: MemoryServer, password: Option<&'static str>) -> Relay {
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (push, mut push_rx) = mpsc::unbounded_channel::<Packet>();

    tokio::spawn(async move {
        let Some(mut peer) = server.accept().await else {
            return;
        };
        peer.ready();
        loop {
            tokio::select! {
                incoming = peer.recv() => {
                    let Some(Ok(packet)) = incoming else { break };
                    answer(&peer, &packet, password);
                    let _ = seen_tx.send(packet);
                }
                Some(packet) = push_rx.recv() => {
                    let _ = peer.send(&packet);
                }
            }
        }
    });

    Relay { seen, push }
}

async fn connected(password: Option<&'static str>) -> (Client, Relay) {
    let (transport, server) = pair();
    let relay = spawn_relay(server, password);
    let credentials = password.map(|p| ("dataplicity", p));
    let client = Client::connect(&config(credentials), &transport)
        .await
        .expect("client should connect");
    (client, relay)
}

#[tokio::test]
async fn test_connect_receives_identity() {
    let (client, mut relay) = connected(None).await;
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.identity(), Some(Bytes::from_static(IDENTITY.as_bytes())));
    assert_eq!(&client.get_identity().await.unwrap()[..], IDENTITY.as_bytes());

    relay.next_of(PacketType::RequestJoin).await;
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_add_route_returns_result_mapping() {
    let (client, mut relay) = connected(None).await;

    let result = client
        .add_route("node-a", "node-b")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.get(&b"status"[..]), Some(&Value::from("ok")));

    let sent = relay.next_of(PacketType::CommandAddRoute).await;
    assert_eq!(sent.get("node1"), Some(&Value::from("node-a")));
    assert_eq!(sent.get("node2"), Some(&Value::from("node-b")));
    assert_eq!(sent.get("port1"), Some(&Value::Int(-1)));
    assert_eq!(sent.get("port2"), Some(&Value::Int(-1)));
    assert_eq!(sent.get("requester"), Some(&Value::from(IDENTITY)));
    assert_eq!(sent.get("forwarded"), Some(&Value::Int(0)));
    client.close().await;
}

#[tokio::test]
async fn test_log_broadcasts_text() {
    let (client, mut relay) = connected(None).await;

    let result = client.log("Hello, World").wait().await.unwrap();
    assert_eq!(
        result.get(&b"command"[..]),
        Some(&Value::from("command_broadcast_log"))
    );
    let sent = relay.next_of(PacketType::CommandBroadcastLog).await;
    assert_eq!(sent.get("text"), Some(&Value::from("Hello, World")));
    client.close().await;
}

#[tokio::test]
async fn test_every_facade_command_round_trips() {
    let (client, _relay) = connected(None).await;

    let mut data = m2m_client::Dict::new();
    data.insert(Bytes::from_static(b"action"), Value::from("sync"));

    let handles = vec![
        client.send_instruction("node-a", data),
        client.name_node("node-a", "kitchen"),
        client.get_identities(["node-a", "node-b"]),
        client.command_log("node-a", "disk full"),
        client.set_auth(3600, "token"),
        client.set_meta("node-a", "color", "blue").await.unwrap(),
        client.get_meta("node-a").await.unwrap(),
    ];
    let mut ids = Vec::new();
    for handle in handles {
        let name = handle.name();
        ids.push(handle.id());
        let result = handle.wait().await.unwrap();
        assert_eq!(result.get(&b"command"[..]), Some(&Value::from(name)));
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(client.metrics().commands_succeeded, 7);
    client.close().await;
}

#[tokio::test]
async fn test_meta_commands_carry_requester() {
    let (client, mut relay) = connected(None).await;

    client
        .set_meta("node-a", "color", "blue")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let sent = relay.next_of(PacketType::CommandSetMeta).await;
    assert_eq!(sent.get("requester"), Some(&Value::from(IDENTITY)));
    assert_eq!(sent.get("key"), Some(&Value::from("color")));
    assert_eq!(sent.get("value"), Some(&Value::from("blue")));
    client.close().await;
}

#[tokio::test]
async fn test_failed_command_reports_message() {
    let (client, _relay) = connected(None).await;

    let err = client
        .get_meta("missing")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    match err {
        ProtocolError::CommandFail(msg) => assert_eq!(msg, "fail; no such device"),
        other => panic!("expected CommandFail, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Ready);
    client.close().await;
}

#[tokio::test]
async fn test_login_with_credentials() {
    let (client, mut relay) = connected(Some("secret")).await;
    let login = relay.next_of(PacketType::RequestLogin).await;
    assert_eq!(login.get("username"), Some(&Value::from("dataplicity")));
    assert_eq!(client.state(), ConnectionState::Ready);
    client.close().await;
}

#[tokio::test]
async fn test_login_failure_fails_connect() {
    let (transport, server) = pair();
    let _relay = spawn_relay(server, Some("secret"));

    let result = Client::connect(&config(Some(("dataplicity", "wrong"))), &transport).await;
    match result {
        Err(ProtocolError::AuthFailed(message)) => {
            assert_eq!(message, "invalid username or password")
        }
        other => panic!("expected AuthFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_connection_fails_connect() {
    let (transport, mut server) = pair();
    tokio::spawn(async move {
        if let Some(peer) = server.accept().await {
            peer.reject("connection refused");
        }
    });

    let result = Client::connect(&config(None), &transport).await;
    assert!(matches!(result, Err(ProtocolError::Connection(_))));
}

#[tokio::test]
async fn test_invalid_config_is_refused_before_connecting() {
    let (transport, _server) = pair();
    let mut config = config(None);
    config.client.url = "gopher://relay".to_string();
    assert!(matches!(
        Client::connect(&config, &transport).await,
        Err(ProtocolError::ConfigError(_))
    ));
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (client, mut relay) = connected(None).await;

    relay.push(Packet::new(PacketType::Ping, vec!["are you there".into()]).unwrap());
    let pong = relay.next_of(PacketType::Pong).await;
    assert_eq!(pong.get("data"), Some(&Value::from("are you there")));
    client.close().await;
}

#[tokio::test]
async fn test_inbound_queue_is_bounded_until_taken() {
    let (transport, server) = pair();
    let mut relay = spawn_relay(server, None);
    let mut config = config(None);
    config.client.inbound_capacity = 4;
    let client = Client::connect(&config, &transport).await.unwrap();

    let payload = Bytes::from(vec![b'x'; 1024]);
    for channel in 0..10i64 {
        relay.push(
            Packet::new(PacketType::Route, vec![channel.into(), payload.clone().into()]).unwrap(),
        );
    }
    // Packets are handled in order, so the pong follows every route
    relay.push(Packet::new(PacketType::Ping, vec!["sync".into()]).unwrap());
    relay.next_of(PacketType::Pong).await;

    assert_eq!(client.metrics().dropped_inbound, 6);
    assert_eq!(client.state(), ConnectionState::Ready);

    let mut inbound = client.inbound().unwrap();
    for channel in 0..4i64 {
        let event = tokio::time::timeout(WAIT, inbound.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            Inbound::Route {
                channel,
                data: payload.clone()
            }
        );
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(50), inbound.next())
            .await
            .is_err()
    );
    client.close().await;
}

#[tokio::test]
async fn test_inbound_traffic_reaches_application() {
    let (client, relay) = connected(None).await;
    let mut inbound = client.inbound().expect("inbound stream");
    assert!(client.inbound().is_none());

    relay.push(
        Packet::new(
            PacketType::Instruction,
            vec!["node-2".into(), Value::dict([("action", "reboot")])],
        )
        .unwrap(),
    );
    relay.push(Packet::new(PacketType::Route, vec![3.into(), "payload".into()]).unwrap());
    relay.push(Packet::new(PacketType::RouteControl, vec![3.into(), "ctl".into()]).unwrap());
    relay.push(Packet::new(PacketType::NotifyOpen, vec![5.into()]).unwrap());
    relay.push(Packet::new(PacketType::NotifyClose, vec![5.into()]).unwrap());

    let mut events = Vec::new();
    for _ in 0..5 {
        let event = tokio::time::timeout(WAIT, inbound.next())
            .await
            .unwrap()
            .unwrap();
        events.push(event);
    }

    match &events[0] {
        Inbound::Instruction { sender, data } => {
            assert_eq!(&sender[..], b"node-2");
            assert_eq!(data.get(&b"action"[..]), Some(&Value::from("reboot")));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        events[1],
        Inbound::Route {
            channel: 3,
            data: Bytes::from_static(b"payload")
        }
    );
    assert_eq!(
        events[2],
        Inbound::RouteControl {
            channel: 3,
            data: Bytes::from_static(b"ctl")
        }
    );
    assert_eq!(events[3], Inbound::ChannelOpened { channel: 5 });
    assert_eq!(events[4], Inbound::ChannelClosed { port: 5 });
    client.close().await;
}

#[tokio::test]
async fn test_server_log_is_consumed() {
    let (client, relay) = connected(None).await;
    relay.push(Packet::new(PacketType::Log, vec!["maintenance at noon".into()]).unwrap());
    relay.push(Packet::new(PacketType::KeepAlive, vec![]).unwrap());

    let deadline = tokio::time::Instant::now() + WAIT;
    while client.metrics().unhandled_packets == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // keep_alive is the only packet without a handler
    assert_eq!(client.metrics().unhandled_packets, 1);
    assert_eq!(client.metrics().handler_errors, 0);
    client.close().await;
}

#[tokio::test]
async fn test_close_fails_outstanding_commands() {
    let (client, mut relay) = connected(None).await;

    let pending = client.check_nodes(["node-a"]);
    relay.next_of(PacketType::CommandCheckNodes).await;

    client.close().await;
    assert!(matches!(
        pending.get(WAIT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(matches!(
        client.log("too late").wait().await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(!client.leave());
}

#[tokio::test]
async fn test_close_sends_leave_notice() {
    let (client, mut relay) = connected(None).await;
    client.close().await;
    relay.next_of(PacketType::RequestLeave).await;
}

#[tokio::test]
async fn test_dropping_client_tears_down() {
    let (client, _relay) = connected(None).await;
    let connection = client.connection().clone();
    drop(client);
    assert_eq!(connection.state(), ConnectionState::Closed);
}
