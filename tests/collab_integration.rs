use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use colabri_live::client::{ClientEvent, CollabClient};
use colabri_live::config::Config;
use colabri_live::db::MemoryGateway;
use colabri_live::doc::Position;
use colabri_live::models::{AwarenessRecord, ErrorCode, RoomId};
use colabri_live::room::Registry;
use colabri_live::routes::build_router;
use colabri_live::AppState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    url: String,
    registry: Registry,
    state: AppState,
}

async fn start_server(config: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Registry::new(Arc::new(MemoryGateway::new()), config.room_config());
    let state = AppState::new(registry.clone(), config);
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        url: format!("ws://{}", addr),
        registry,
        state,
    }
}

fn room(id: &str) -> RoomId {
    RoomId::new("doc", id).unwrap()
}

/// Waits for the first event matching `pred`, skipping the others.
async fn wait_for<F>(client: &mut CollabClient, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn join(server: &TestServer, room_id: &RoomId, user: &str) -> CollabClient {
    let mut client = CollabClient::connect(&server.url, room_id, user, user).await.unwrap();
    wait_for(&mut client, |e| *e == ClientEvent::Synced).await;
    client
}

fn is_delta(e: &ClientEvent) -> bool {
    matches!(e, ClientEvent::RemoteDelta(_))
}

#[tokio::test]
async fn concurrent_text_edits_converge() {
    let server = start_server(Config::default()).await;
    let room_id = room("text-merge");
    let mut alice = join(&server, &room_id, "alice").await;
    let mut bob = join(&server, &room_id, "bob").await;

    alice.edit(|r| r.insert_text(None, 0, "Hello")).await.unwrap();
    wait_for(&mut bob, is_delta).await;
    assert_eq!(bob.view(), alice.view());

    alice.edit(|r| r.insert_text(None, 5, " world")).await.unwrap();
    bob.edit(|r| r.insert_text(None, 5, "!")).await.unwrap();
    wait_for(&mut alice, is_delta).await;
    wait_for(&mut bob, is_delta).await;

    assert_eq!(alice.view(), bob.view());
    let text = alice.replica().doc().text().plain_text(None);
    assert!(text == "Hello world!" || text == "Hello! world", "got {text}");
}

#[tokio::test]
async fn concurrent_node_and_edge_inserts_appear_once() {
    let server = start_server(Config::default()).await;
    let room_id = RoomId::new("graph", "flow").unwrap();
    let mut x = join(&server, &room_id, "x").await;
    let mut y = join(&server, &room_id, "y").await;

    let fields = BTreeMap::from([("position".to_string(), serde_json::json!({"x": 10, "y": 20}))]);
    x.edit(|r| r.put_node("n1", fields)).await.unwrap();
    y.edit(|r| r.put_edge("e1", "n1", "n2")).await.unwrap();
    wait_for(&mut x, is_delta).await;
    wait_for(&mut y, is_delta).await;

    for view in [x.view(), y.view()] {
        assert_eq!(view.nodes.len(), 1);
        let node = &view.nodes["n1"];
        assert_eq!(node.position, Some(Position { x: 10.0, y: 20.0 }));
        assert!(!node.needs_layout);
        assert_eq!(view.edges.len(), 1);
        assert_eq!(view.edges["e1"].source.as_deref(), Some("n1"));
        assert_eq!(view.edges["e1"].target.as_deref(), Some("n2"));
    }
}

#[tokio::test]
async fn graph_fields_merge_between_clients() {
    let server = start_server(Config::default()).await;
    let room_id = RoomId::new("graph", "board").unwrap();
    let mut alice = join(&server, &room_id, "alice").await;
    let mut bob = join(&server, &room_id, "bob").await;

    alice
        .edit(|r| r.set_node_field("n1", "label", serde_json::json!("Start")))
        .await
        .unwrap();
    wait_for(&mut bob, is_delta).await;
    bob.edit(|r| r.set_node_field("n1", "position", serde_json::json!({"x": 10, "y": 20})))
        .await
        .unwrap();
    wait_for(&mut alice, is_delta).await;

    let view = alice.view();
    let node = &view.nodes["n1"];
    assert_eq!(node.data["label"], "Start");
    assert!(!node.needs_layout);
    assert_eq!(view, bob.view());
}

#[tokio::test]
async fn presence_reaches_others_but_never_self() {
    let server = start_server(Config::default()).await;
    let room_id = room("presence");
    let mut alice = join(&server, &room_id, "alice").await;
    let mut bob = join(&server, &room_id, "bob").await;

    let mut state = AwarenessRecord::new("alice", "Alice", "#e11d48");
    state.selected_node_id = Some("n1".into());
    alice.send_awareness(state).await.unwrap();

    match wait_for(&mut bob, |e| matches!(e, ClientEvent::Presence(users) if !users.is_empty())).await {
        ClientEvent::Presence(users) => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user_id, "alice");
            assert_eq!(users[0].selected_node_id.as_deref(), Some("n1"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    bob.send_awareness(AwarenessRecord::new("bob", "Bob", "#2563eb")).await.unwrap();
    match wait_for(&mut alice, |e| matches!(e, ClientEvent::Presence(users) if !users.is_empty())).await {
        ClientEvent::Presence(users) => assert!(users.iter().all(|u| u.user_id != "alice")),
        other => panic!("unexpected event {:?}", other),
    }

    alice.close().await;
    match wait_for(&mut bob, |e| matches!(e, ClientEvent::Presence(_))).await {
        ClientEvent::Presence(users) => assert!(users.is_empty()),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn reconnecting_client_resends_offline_edits_once() {
    let server = start_server(Config::default()).await;
    let room_id = room("scenario-c");
    let alice = join(&server, &room_id, "alice").await;
    let mut bob = join(&server, &room_id, "bob").await;

    let first = alice.edit(|r| r.insert_text(None, 0, "abc")).await.unwrap();
    wait_for(&mut bob, is_delta).await;

    let mut replica = alice.close().await;
    replica.insert_text(None, 3, "d").unwrap();

    let mut alice = CollabClient::connect_with_replica(&server.url, &room_id, "alice", "alice", replica)
        .await
        .unwrap();
    wait_for(&mut alice, |e| *e == ClientEvent::Synced).await;
    wait_for(&mut bob, is_delta).await;
    assert_eq!(bob.replica().doc().text().plain_text(None), "abcd");

    // A plain retransmission changes nothing.
    alice.send_delta(&first).await.unwrap();
    let handle = server.registry.lookup(&room_id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.stats().await.unwrap().ops, 2);
    assert_eq!(bob.view(), alice.view());
}

#[tokio::test]
async fn full_registry_refuses_new_rooms() {
    let config = Config {
        max_rooms: 1,
        ..Config::default()
    };
    let server = start_server(config).await;
    let _alice = join(&server, &room("one"), "alice").await;

    let mut bob = CollabClient::connect(&server.url, &room("two"), "bob", "bob").await.unwrap();
    match wait_for(&mut bob, |e| matches!(e, ClientEvent::Error(_))).await {
        ClientEvent::Error(error) => assert_eq!(error.code, ErrorCode::CapacityExhausted),
        other => panic!("unexpected event {:?}", other),
    }
    wait_for(&mut bob, |e| *e == ClientEvent::Closed).await;
    assert_eq!(server.registry.room_count(), 1);
}

#[tokio::test]
async fn http_routes_report_rooms() {
    let server = start_server(Config::default()).await;
    let router = build_router(server.state.clone());

    let response = router
        .clone()
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(Request::get("/api/v1/rooms/doc/missing/export").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let room_id = room("exported");
    let alice = join(&server, &room_id, "alice").await;
    alice.edit(|r| r.insert_text(None, 0, "hi")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = router
        .clone()
        .oneshot(Request::get("/api/v1/rooms/doc/exported/export").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["roomId"], "doc/exported");
    assert_eq!(json["connections"], 1);
    assert_eq!(json["view"]["text"][0]["text"], "hi");
    assert!(json["snapshot"].as_str().is_some_and(|s| !s.is_empty()));

    let response = router
        .oneshot(Request::get("/api/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["rooms"], 1);
}
