use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use roomsync::client::SyncClient;
use roomsync::codec::{self, Message, ACCEPT_HEADER, ACCEPT_OK};
use roomsync::cursor::CursorStore;
use roomsync::schema::SchemaDef;
use roomsync::server::{self, ReplicaCache, ServerState};
use roomsync::SyncError;
use sqlite_changelog::ChangeLogStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS test (
    id INTEGER PRIMARY KEY,
    content TEXT,
    position INTEGER
);";

fn schema() -> SchemaDef {
    SchemaDef::new("todo", SCHEMA)
}

fn spawn_server(data_dir: Option<std::path::PathBuf>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.set_nonblocking(true).expect("nonblocking listener");
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState {
        replicas: ReplicaCache::new(schema(), data_dir),
    });
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .expect("server from listener")
            .serve(server::routes::router(state).into_make_service())
            .await
            .expect("test server failed");
    });
    addr
}

fn client_fixture(
    server: &SocketAddr,
    room: &str,
) -> (SyncClient, Arc<Mutex<ChangeLogStore>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ChangeLogStore::open(dir.path().join("replica.db")).unwrap();
    let schema = schema();
    store
        .apply_schema(&schema.name, schema.fingerprint(), &schema.text)
        .unwrap();
    let store = Arc::new(Mutex::new(store));
    let cursors = CursorStore::open(&dir.path().join("state")).unwrap();
    let client = SyncClient::new(
        format!("http://{server}"),
        room,
        schema.fingerprint(),
        Arc::clone(&store),
        cursors,
    )
    .unwrap();
    (client, store, dir)
}

#[tokio::test]
async fn change_propagates_from_a_to_b_through_the_server() {
    let addr = spawn_server(None);

    let (client_a, store_a, _dir_a) = client_fixture(&addr, "demo");
    store_a
        .lock()
        .unwrap()
        .put(
            "test",
            &json!(1),
            &[("content", json!("hello")), ("position", json!(-1))],
        )
        .unwrap();

    let summary = client_a.round_trip().await.unwrap();
    assert_eq!(summary.sent, 2);
    assert!(summary.accepted);
    assert_eq!(summary.last_sent, 1);
    // The server had nothing for us.
    assert_eq!(summary.received, 0);

    let (client_b, store_b, _dir_b) = client_fixture(&addr, "demo");
    let summary = client_b.round_trip().await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.received, 2);
    assert!(summary.last_seen > 0);

    let rows = store_b
        .lock()
        .unwrap()
        .query("SELECT id, content, position FROM test", &[])
        .unwrap();
    assert_eq!(rows, vec![vec![json!(1), json!("hello"), json!(-1)]]);

    // Attribution: B's copy carries A's site id.
    let site_a = store_a.lock().unwrap().site_id();
    let merged = store_b
        .lock()
        .unwrap()
        .changes_since_excluding(0, &[0u8; 16])
        .unwrap();
    assert!(merged.iter().all(|change| change.site_id == Some(site_a)));
}

#[tokio::test]
async fn server_never_echoes_a_replica_its_own_changes() {
    let addr = spawn_server(None);
    let (client, store, _dir) = client_fixture(&addr, "echo");
    store
        .lock()
        .unwrap()
        .put("test", &json!(1), &[("content", json!("mine"))])
        .unwrap();

    client.round_trip().await.unwrap();
    let again = client.round_trip().await.unwrap();
    assert_eq!(again.sent, 0);
    assert_eq!(again.received, 0);
}

#[tokio::test]
async fn repeated_round_trips_are_idempotent_and_cursors_monotonic() {
    let addr = spawn_server(None);
    let (client_a, store_a, _dir_a) = client_fixture(&addr, "idem");
    let (client_b, store_b, _dir_b) = client_fixture(&addr, "idem");

    store_a
        .lock()
        .unwrap()
        .put("test", &json!(1), &[("content", json!("v1"))])
        .unwrap();
    let first = client_a.round_trip().await.unwrap();
    let b_first = client_b.round_trip().await.unwrap();

    store_a
        .lock()
        .unwrap()
        .put("test", &json!(1), &[("content", json!("v2"))])
        .unwrap();
    let second = client_a.round_trip().await.unwrap();
    let b_second = client_b.round_trip().await.unwrap();

    assert!(second.last_sent >= first.last_sent);
    assert!(b_second.last_seen >= b_first.last_seen);
    let rows = store_b
        .lock()
        .unwrap()
        .query("SELECT content FROM test WHERE id = 1", &[])
        .unwrap();
    assert_eq!(rows, vec![vec![json!("v2")]]);
}

#[tokio::test]
async fn network_failure_mutates_nothing() {
    // Nothing listens on this address.
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let (client, store, dir) = client_fixture(&addr, "offline");
    store
        .lock()
        .unwrap()
        .put("test", &json!(1), &[("content", json!("queued"))])
        .unwrap();

    let err = client.round_trip().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));

    let cursors = CursorStore::open(&dir.path().join("state")).unwrap();
    let site = store.lock().unwrap().site_id();
    let cursor = cursors.get(&site, "offline").unwrap();
    assert_eq!(cursor.last_sent, 0);
    assert_eq!(cursor.last_seen, 0);
}

#[tokio::test]
async fn pull_against_an_unknown_room_asks_for_a_push_first() {
    let data_dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(Some(data_dir.path().to_path_buf()));
    let (client, _store, _dir) = client_fixture(&addr, "empty-room");

    let err = client.round_trip().await.unwrap_err();
    match err {
        SyncError::Server { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("push changes first"), "got: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn schema_version_skew_is_rejected() {
    let addr = spawn_server(None);
    let dir = tempfile::tempdir().unwrap();
    let mut store = ChangeLogStore::open(dir.path().join("replica.db")).unwrap();
    store.apply_schema("todo", 999, SCHEMA).unwrap();
    let client = SyncClient::new(
        format!("http://{addr}"),
        "skew",
        999,
        Arc::new(Mutex::new(store)),
        CursorStore::open(&dir.path().join("state")).unwrap(),
    )
    .unwrap();

    let err = client.round_trip().await.unwrap_err();
    match err {
        SyncError::Server { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("schema version mismatch"), "got: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rejected_push_leaves_last_sent_unchanged() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/changes/mocked"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(ACCEPT_HEADER, "error=ping")
                .set_body_bytes(Vec::new()),
        )
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut store = ChangeLogStore::open(dir.path().join("replica.db")).unwrap();
    let schema = schema();
    store
        .apply_schema(&schema.name, schema.fingerprint(), &schema.text)
        .unwrap();
    store
        .put("test", &json!(1), &[("content", json!("pending"))])
        .unwrap();
    let client = SyncClient::new(
        mock.uri(),
        "mocked",
        schema.fingerprint(),
        Arc::new(Mutex::new(store)),
        CursorStore::open(&dir.path().join("state")).unwrap(),
    )
    .unwrap();

    let summary = client.round_trip().await.unwrap();
    assert_eq!(summary.sent, 1);
    assert!(!summary.accepted);
    assert_eq!(summary.last_sent, 0);
    assert_eq!(summary.last_seen, 0);
}

#[tokio::test]
async fn unexpected_response_tag_is_ignored_without_moving_cursors() {
    let body = codec::encode(&Message::Ping).unwrap();
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/changes/mocked"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(ACCEPT_HEADER, ACCEPT_OK)
                .set_body_bytes(body),
        )
        .mount(&mock)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut store = ChangeLogStore::open(dir.path().join("replica.db")).unwrap();
    let schema = schema();
    store
        .apply_schema(&schema.name, schema.fingerprint(), &schema.text)
        .unwrap();
    let client = SyncClient::new(
        mock.uri(),
        "mocked",
        schema.fingerprint(),
        Arc::new(Mutex::new(store)),
        CursorStore::open(&dir.path().join("state")).unwrap(),
    )
    .unwrap();

    let summary = client.round_trip().await.unwrap();
    assert_eq!(summary.received, 0);
    assert_eq!(summary.last_seen, 0);
}
