//! Integration tests for end-to-end room sync.
//!
//! These tests start a real server and connect real WebSocket clients,
//! verifying joins, relay, snapshot versioning and departures.

use coderoom_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use coderoom_collab::protocol::{
    ClientEvent, CodeChangePayload, ConnectionId, DisconnectedPayload, EditOperation, JoinPayload,
    RequestCodePayload, SendCurrentCodePayload, ServerEvent, SyncCodePayload,
};
use coderoom_collab::server::{ServerConfig, SyncServer};
use coderoom_collab::store::PLACEHOLDER_BODY;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port.
async fn start_server(config: ServerConfig) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(config).unwrap();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await.unwrap();
    });
    port
}

async fn start_test_server() -> u16 {
    start_server(ServerConfig {
        request_peer_snapshot: false,
        ..ServerConfig::default()
    })
    .await
}

async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, event: ClientEvent) {
    ws.send(Message::Text(event.encode().unwrap().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return ServerEvent::decode(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(150), ws.next()).await {
        panic!("unexpected event: {text}");
    }
}

fn join_event(room: &str, name: &str) -> ClientEvent {
    ClientEvent::Join(JoinPayload {
        room_id: room.into(),
        username: name.into(),
    })
}

/// Join and consume the initial snapshot and `joined`; returns the snapshot
/// version and this connection's id.
async fn join(ws: &mut Ws, room: &str, name: &str) -> (u64, ConnectionId) {
    send(ws, join_event(room, name)).await;
    let version = match recv(ws).await {
        ServerEvent::SyncCodeResponse(resp) => resp.version.unwrap(),
        other => panic!("expected snapshot, got {other:?}"),
    };
    match recv(ws).await {
        ServerEvent::Joined(p) => {
            assert_eq!(p.username, name);
            (version, p.socket_id)
        }
        other => panic!("expected joined, got {other:?}"),
    }
}

fn push(room: &str, code: &str, client_version: Option<u64>, force: bool) -> ClientEvent {
    ClientEvent::SendCurrentCode(SendCurrentCodePayload {
        room_id: room.into(),
        code: code.into(),
        force: force.then_some(true),
        client_version,
    })
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_first_joiner_gets_placeholder() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;

    send(&mut alice, join_event("fresh", "alice")).await;
    match recv(&mut alice).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some(PLACEHOLDER_BODY));
            assert_eq!(resp.version, Some(0));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    match recv(&mut alice).await {
        ServerEvent::Joined(p) => {
            assert_eq!(p.users.len(), 1);
            assert_eq!(p.users[0].username, "alice");
            assert_eq!(p.username, "alice");
        }
        other => panic!("expected joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_announces_full_member_list() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;

    let (_, alice_id) = join(&mut alice, "room", "alice").await;
    send(&mut bob, join_event("room", "bob")).await;

    assert!(matches!(recv(&mut bob).await, ServerEvent::SyncCodeResponse(_)));
    for ws in [&mut alice, &mut bob] {
        match recv(ws).await {
            ServerEvent::Joined(p) => {
                let names: Vec<_> = p.users.iter().map(|m| m.username.as_str()).collect();
                assert_eq!(names, ["alice", "bob"]);
                assert_eq!(p.users[0].socket_id, alice_id);
                assert_eq!(p.username, "bob");
            }
            other => panic!("expected joined, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_peer_snapshot_requested_from_earliest_member() {
    let port = start_server(ServerConfig::default()).await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;

    join(&mut alice, "room", "alice").await;
    join(&mut bob, "room", "bob").await;

    assert!(matches!(recv(&mut alice).await, ServerEvent::Joined(_)));
    match recv(&mut alice).await {
        ServerEvent::RequestCurrentCode(p) => assert_eq!(p.room_id, "room"),
        other => panic!("expected request-current-code, got {other:?}"),
    }
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn test_code_change_relayed_without_echo() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "room", "alice").await;
    join(&mut bob, "room", "bob").await;
    recv(&mut alice).await; // bob's joined

    let change = EditOperation::insert(1, 1, "fn main() {}");
    send(
        &mut alice,
        ClientEvent::CodeChange(CodeChangePayload {
            room_id: Some("room".into()),
            changes: vec![change.clone()],
        }),
    )
    .await;

    match recv(&mut bob).await {
        ServerEvent::CodeChange(p) => assert_eq!(p.changes, vec![change]),
        other => panic!("expected code-change, got {other:?}"),
    }
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_stale_snapshot_rejected_and_force_overrides() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "room", "alice").await;
    join(&mut bob, "room", "bob").await;
    recv(&mut alice).await;

    // Alice publishes at v0: accepted, whole room sees v1
    send(&mut alice, push("room", "hello", Some(0), false)).await;
    for ws in [&mut alice, &mut bob] {
        match recv(ws).await {
            ServerEvent::SyncCodeResponse(resp) => {
                assert_eq!(resp.code.as_deref(), Some("hello"));
                assert_eq!(resp.version, Some(1));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    // Bob still claims v0: rejected, nobody hears about it
    send(&mut bob, push("room", "stale body", Some(0), false)).await;
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;

    // Forced push wins regardless of version
    send(&mut bob, push("room", "forced", Some(0), true)).await;
    for ws in [&mut alice, &mut bob] {
        match recv(ws).await {
            ServerEvent::SyncCodeResponse(resp) => {
                assert_eq!(resp.code.as_deref(), Some("forced"));
                assert_eq!(resp.version, Some(2));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_identical_snapshot_rebroadcast_to_room() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "room", "alice").await;
    join(&mut bob, "room", "bob").await;
    recv(&mut alice).await;

    send(&mut alice, push("room", "shared", Some(0), false)).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    // Same body again: version stays, but every member gets the body
    send(&mut bob, push("room", "shared", Some(1), false)).await;
    for ws in [&mut alice, &mut bob] {
        match recv(ws).await {
            ServerEvent::SyncCodeResponse(resp) => {
                assert_eq!(resp.code.as_deref(), Some("shared"));
                assert_eq!(resp.version, Some(1));
                assert!(!resp.is_up_to_date());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_request_code_by_version() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    join(&mut alice, "room", "alice").await;
    send(&mut alice, push("room", "v1 body", Some(0), false)).await;
    recv(&mut alice).await;

    let request = |cv| {
        ClientEvent::RequestCode(RequestCodePayload {
            room_id: "room".into(),
            client_version: cv,
        })
    };

    send(&mut alice, request(Some(1))).await;
    match recv(&mut alice).await {
        ServerEvent::SyncCodeResponse(resp) => assert!(resp.is_up_to_date()),
        other => panic!("expected up-to-date, got {other:?}"),
    }

    send(&mut alice, request(Some(0))).await;
    match recv(&mut alice).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some("v1 body"));
            assert_eq!(resp.version, Some(1));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_legacy_sync_code_pull() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    join(&mut alice, "room", "alice").await;

    send(
        &mut alice,
        ClientEvent::SyncCode(SyncCodePayload {
            room_id: "room".into(),
            code: None,
            client_version: None,
        }),
    )
    .await;
    match recv(&mut alice).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some(PLACEHOLDER_BODY));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_notifies_remaining_members() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "room", "alice").await;
    let (_, bob_id) = join(&mut bob, "room", "bob").await;
    recv(&mut alice).await;

    bob.close(None).await.unwrap();

    match recv(&mut alice).await {
        ServerEvent::Disconnected(p) => {
            assert_eq!(p.socket_id, Some(bob_id));
            assert_eq!(p.username.as_deref(), Some("bob"));
            assert_eq!(p.room_id.as_deref(), Some("room"));
        }
        other => panic!("expected disconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_explicit_leave_keeps_socket_open() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "room", "alice").await;
    join(&mut bob, "room", "bob").await;
    recv(&mut alice).await;

    send(
        &mut bob,
        ClientEvent::Disconnected(DisconnectedPayload {
            socket_id: None,
            username: None,
            room_id: Some("room".into()),
        }),
    )
    .await;
    assert!(matches!(recv(&mut alice).await, ServerEvent::Disconnected(_)));

    // Bob can join another room on the same socket
    let (version, _) = join(&mut bob, "other", "bob").await;
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_emptied_room_resets_to_placeholder() {
    let port = start_test_server().await;

    let mut alice = connect(port).await;
    join(&mut alice, "room", "alice").await;
    send(&mut alice, push("room", "left behind", Some(0), false)).await;
    recv(&mut alice).await;
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = connect(port).await;
    send(&mut bob, join_event("room", "bob")).await;
    match recv(&mut bob).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some(PLACEHOLDER_BODY));
            assert_eq!(resp.version, Some(0));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_events_from_non_members_are_dropped() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut mallory = connect(port).await;
    join(&mut alice, "room", "alice").await;

    send(
        &mut mallory,
        ClientEvent::CodeChange(CodeChangePayload {
            room_id: Some("room".into()),
            changes: vec![EditOperation::insert(1, 1, "x")],
        }),
    )
    .await;
    send(&mut mallory, push("room", "hijack", None, true)).await;

    assert_silent(&mut alice).await;
    assert_silent(&mut mallory).await;
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_alive() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;

    alice.send(Message::Text("not json".into())).await.unwrap();
    alice
        .send(Message::Text(r#"{"event":"no-such-event","data":{}}"#.into()))
        .await
        .unwrap();

    let (version, _) = join(&mut alice, "room", "alice").await;
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_sync_clients_converge() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut c1 = SyncClient::new(ClientConfig::new(url.as_str(), "shared", "alice"));
    let mut rx1 = c1.take_event_rx().unwrap();
    c1.connect().await.unwrap();
    assert_eq!(rx1.recv().await, Some(SyncEvent::Connected));
    assert_eq!(c1.connection_state().await, ConnectionState::Connected);

    // Wait for the initial snapshot to land
    loop {
        match timeout(Duration::from_secs(2), rx1.recv()).await.unwrap() {
            Some(SyncEvent::MembersChanged { .. }) => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
    assert_eq!(c1.value().await, PLACEHOLDER_BODY);
    assert_eq!(c1.version().await, Some(0));

    c1.edit(&[EditOperation::insert(1, 1, "let x = 1;\n")]).await.unwrap();
    let expected = format!("let x = 1;\n{PLACEHOLDER_BODY}");

    let mut c2 = SyncClient::new(ClientConfig::new(url.as_str(), "shared", "bob"));
    c2.connect().await.unwrap();

    timeout(Duration::from_secs(2), async {
        while c2.value().await != expected || c1.version().await != Some(1) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("clients did not converge");

    c2.edit(&[EditOperation::insert(2, 1, "// ")]).await.unwrap();
    let expected = format!("let x = 1;\n// {PLACEHOLDER_BODY}");
    timeout(Duration::from_secs(2), async {
        while c1.value().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("remote edit not applied");

    c1.disconnect().await;
    assert_eq!(c1.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_two_writers_scenario() {
    let port = start_test_server().await;
    let mut a = connect(port).await;
    let mut b = connect(port).await;

    let (version, _) = join(&mut a, "r1", "a").await;
    assert_eq!(version, 0);
    send(&mut a, push("r1", "hello", None, true)).await;
    assert!(matches!(recv(&mut a).await, ServerEvent::SyncCodeResponse(r) if r.version == Some(1)));

    send(&mut b, join_event("r1", "b")).await;
    match recv(&mut b).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some("hello"));
            assert_eq!(resp.version, Some(1));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert!(matches!(recv(&mut b).await, ServerEvent::Joined(_)));
    assert!(matches!(recv(&mut a).await, ServerEvent::Joined(_)));

    send(&mut b, push("r1", "hello", Some(1), false)).await;
    for ws in [&mut a, &mut b] {
        match recv(ws).await {
            ServerEvent::SyncCodeResponse(resp) => {
                assert_eq!(resp.code.as_deref(), Some("hello"));
                assert_eq!(resp.version, Some(1));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    send(&mut b, push("r1", "world", Some(1), true)).await;
    for ws in [&mut a, &mut b] {
        assert!(matches!(recv(ws).await, ServerEvent::SyncCodeResponse(r) if r.version == Some(2)));
    }

    send(
        &mut a,
        ClientEvent::RequestCode(RequestCodePayload {
            room_id: "r1".into(),
            client_version: Some(1),
        }),
    )
    .await;
    match recv(&mut a).await {
        ServerEvent::SyncCodeResponse(resp) => {
            assert_eq!(resp.code.as_deref(), Some("world"));
            assert_eq!(resp.version, Some(2));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}
