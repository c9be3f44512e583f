//! Integration tests for the WebSocket relay.
//!
//! These tests start a real server and connect real clients, verifying
//! room signalling, encrypted fan-out, follow cascades and offline replay.

use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use vellum_collab::client::{ConnectionState, RelayClient, RelayEvent};
use vellum_collab::codec::CodecError;
use vellum_collab::payload::{PointerButton, ScenePayload};
use vellum_collab::protocol::{FollowAction, ServerEvent};
use vellum_collab::server::{RelayServer, ServerConfig};
use vellum_core::{Delta, Scene, SceneGraph};
use vellum_render::{DeltaRenderer, FrameRecorder, ShapeFactory};

/// Start a server on an ephemeral port, return its URL.
async fn start_test_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(ServerConfig::for_testing());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

async fn next_event(rx: &mut Receiver<RelayEvent>) -> RelayEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches.
async fn wait_for<F>(rx: &mut Receiver<RelayEvent>, mut matches: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Connect a client to `room` and wait until it has its id and the roster
/// includes it.
async fn joined(url: &str, room: &str, secret: &str) -> (RelayClient, Receiver<RelayEvent>, Uuid) {
    let mut client = RelayClient::new(url, room, secret);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let id = match wait_for(&mut rx, |e| matches!(e, RelayEvent::Init { .. })).await {
        RelayEvent::Init { connection_id } => connection_id,
        other => panic!("unexpected {other:?}"),
    };
    wait_for(&mut rx, |e| matches!(e, RelayEvent::RoomUserChange(m) if m.contains(&id))).await;
    (client, rx, id)
}

fn scene_update(id: Uuid, z: i64) -> ScenePayload {
    ScenePayload::SceneUpdate {
        deltas: vec![Delta::add(
            id,
            json!({"type": "rect", "left": 10, "top": 10, "width": 20, "height": 20, "zIndex": z}),
        )],
    }
}

#[tokio::test]
async fn test_server_sends_init_first() {
    let url = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frame = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = frame else {
        panic!("expected binary frame, got {frame:?}");
    };
    assert!(matches!(
        ServerEvent::decode(&data).unwrap(),
        ServerEvent::InitRoom { .. }
    ));
}

#[tokio::test]
async fn test_first_in_room_then_roster() {
    let url = start_test_server().await;
    let mut client = RelayClient::new(url.as_str(), "solo", "s");
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(next_event(&mut rx).await, RelayEvent::Connected);
    let RelayEvent::Init { connection_id } = next_event(&mut rx).await else {
        panic!("expected Init");
    };
    assert_eq!(next_event(&mut rx).await, RelayEvent::FirstInRoom);
    assert_eq!(
        next_event(&mut rx).await,
        RelayEvent::RoomUserChange(vec![connection_id])
    );
    assert_eq!(client.connection_id().await, Some(connection_id));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_second_joiner_announced_before_roster() {
    let url = start_test_server().await;
    let (_a, mut rx_a, a) = joined(&url, "pair", "s").await;

    let mut b_client = RelayClient::new(url.as_str(), "pair", "s");
    let mut rx_b = b_client.take_event_rx().unwrap();
    b_client.connect().await.unwrap();

    let RelayEvent::NewUser(b) = next_event(&mut rx_a).await else {
        panic!("expected NewUser first");
    };
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(next_event(&mut rx_a).await, RelayEvent::RoomUserChange(expected.clone()));

    // The second joiner never sees FirstInRoom
    let roster = wait_for(&mut rx_b, |e| {
        assert_ne!(*e, RelayEvent::FirstInRoom);
        matches!(e, RelayEvent::RoomUserChange(_))
    })
    .await;
    assert_eq!(roster, RelayEvent::RoomUserChange(expected));
}

#[tokio::test]
async fn test_encrypted_scene_update_between_clients() {
    let url = start_test_server().await;
    let (a, _rx_a, _) = joined(&url, "design", "shared").await;
    let (_b, mut rx_b, _) = joined(&url, "design", "shared").await;

    let payload = scene_update(Uuid::new_v4(), 3);
    a.send(&payload).await.unwrap();

    let received = wait_for(&mut rx_b, |e| matches!(e, RelayEvent::RemoteScene(_))).await;
    assert_eq!(received, RelayEvent::RemoteScene(payload));
}

#[tokio::test]
async fn test_volatile_pointer_update_delivered() {
    let url = start_test_server().await;
    let (a, _rx_a, _) = joined(&url, "cursors", "k").await;
    let (_b, mut rx_b, _) = joined(&url, "cursors", "k").await;

    let pointer = ScenePayload::PointerUpdate {
        x: 4.0,
        y: 2.0,
        button: PointerButton::Down,
        username: "ana".into(),
    };
    a.send(&pointer).await.unwrap();

    let received = wait_for(&mut rx_b, |e| matches!(e, RelayEvent::RemoteScene(_))).await;
    assert_eq!(received, RelayEvent::RemoteScene(pointer));
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let url = start_test_server().await;
    let (a, _rx_a, _) = joined(&url, "locked", "right").await;
    let (_b, mut rx_b, _) = joined(&url, "locked", "wrong").await;

    a.send(&scene_update(Uuid::new_v4(), 0)).await.unwrap();

    let received = wait_for(&mut rx_b, |e| {
        matches!(e, RelayEvent::RemoteScene(_) | RelayEvent::PayloadRejected(_))
    })
    .await;
    assert_eq!(received, RelayEvent::PayloadRejected(CodecError::Authentication));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_test_server().await;
    let (a, _rx_a, _) = joined(&url, "one", "k").await;
    let (_b, mut rx_b, _) = joined(&url, "one", "k").await;
    let (c, mut rx_c, _) = joined(&url, "two", "k").await;

    a.send(&scene_update(Uuid::new_v4(), 0)).await.unwrap();
    wait_for(&mut rx_b, |e| matches!(e, RelayEvent::RemoteScene(_))).await;

    // Everything for room "one" has been fanned out by now
    c.send_ping().await.unwrap();
    assert_eq!(next_event(&mut rx_c).await, RelayEvent::Pong);
}

#[tokio::test]
async fn test_follow_then_disconnect_cascade() {
    let url = start_test_server().await;
    let (_target, mut rx_t, t) = joined(&url, "room", "k").await;
    let (mut follower, _rx_f, f) = joined(&url, "room", "k").await;

    follower.follow(t, FollowAction::Follow).await.unwrap();
    let change = wait_for(&mut rx_t, |e| matches!(e, RelayEvent::FollowersChanged(_))).await;
    assert_eq!(change, RelayEvent::FollowersChanged(vec![f]));

    follower.disconnect().await;

    // Last follower gone: one BroadcastUnfollow, and a roster without them
    wait_for(&mut rx_t, |e| *e == RelayEvent::BroadcastUnfollow).await;
    let roster = wait_for(&mut rx_t, |e| matches!(e, RelayEvent::RoomUserChange(_))).await;
    assert_eq!(roster, RelayEvent::RoomUserChange(vec![t]));
}

#[tokio::test]
async fn test_unfollow_reports_remaining_followers() {
    let url = start_test_server().await;
    let (_target, mut rx_t, t) = joined(&url, "room", "k").await;
    let (f1, _rx1, id1) = joined(&url, "room", "k").await;
    let (f2, _rx2, id2) = joined(&url, "room", "k").await;

    f1.follow(t, FollowAction::Follow).await.unwrap();
    wait_for(&mut rx_t, |e| *e == RelayEvent::FollowersChanged(vec![id1])).await;
    f2.follow(t, FollowAction::Follow).await.unwrap();
    wait_for(&mut rx_t, |e| matches!(e, RelayEvent::FollowersChanged(v) if v.len() == 2)).await;

    f1.follow(t, FollowAction::Unfollow).await.unwrap();
    let change = wait_for(&mut rx_t, |e| matches!(e, RelayEvent::FollowersChanged(_))).await;
    assert_eq!(change, RelayEvent::FollowersChanged(vec![id2]));
}

#[tokio::test]
async fn test_offline_queue_replay() {
    let url = start_test_server().await;
    let (_b, mut rx_b, _) = joined(&url, "late", "k").await;

    let mut a = RelayClient::new(url.as_str(), "late", "k");
    let payload = scene_update(Uuid::new_v4(), 1);
    a.send(&payload).await.unwrap();
    assert_eq!(a.offline_queue_len().await, 1);

    a.connect().await.unwrap();
    assert_eq!(a.offline_queue_len().await, 0);

    let received = wait_for(&mut rx_b, |e| matches!(e, RelayEvent::RemoteScene(_))).await;
    assert_eq!(received, RelayEvent::RemoteScene(payload));
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_test_server().await;
    let (client, mut rx, _) = joined(&url, "hb", "k").await;
    client.send_ping().await.unwrap();
    assert_eq!(next_event(&mut rx).await, RelayEvent::Pong);
}

#[tokio::test]
async fn test_remote_scene_drives_renderer() {
    let url = start_test_server().await;
    let (a, _rx_a, _) = joined(&url, "canvas", "k").await;
    let (_b, mut rx_b, _) = joined(&url, "canvas", "k").await;

    let (low, high) = (Uuid::new_v4(), Uuid::new_v4());
    a.send(&ScenePayload::SceneUpdate {
        deltas: vec![
            Delta::add(high, json!({"type": "ellipse", "width": 5, "height": 5, "zIndex": 9})),
            Delta::add(low, json!({"type": "rect", "width": 5, "height": 5, "zIndex": 1})),
        ],
    })
    .await
    .unwrap();

    let RelayEvent::RemoteScene(ScenePayload::SceneUpdate { deltas }) =
        wait_for(&mut rx_b, |e| matches!(e, RelayEvent::RemoteScene(_))).await
    else {
        panic!("expected a scene update");
    };

    let mut renderer = DeltaRenderer::new(Scene::new(), ShapeFactory, FrameRecorder::new());
    renderer.apply_batch(deltas).unwrap();
    renderer.settle().await;

    let ordered: Vec<_> = renderer.scene().ordered().iter().map(|e| e.object_id).collect();
    assert_eq!(ordered, vec![low, high]);
    assert_eq!(renderer.target().last().unwrap().ids, vec![low, high]);
}
