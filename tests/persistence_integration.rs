//! Persistence and lifecycle tests: debounced saves, flush on last
//! disconnect, the oversized-document ceiling, idle unload, and durable
//! round-trips through the RocksDB store.

use futures_util::{SinkExt, StreamExt};
use labnote_collab::{
    AuthSuccessPayload, CollabServer, Envelope, InMemoryPermissionStore, MemoryStateStore,
    MessageKind, PermissionLevel, RocksStateStore, ServerConfig, StateStore, StaticTokenValidator,
    StoreConfig, UserInfo,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    server: Arc<CollabServer>,
    url: String,
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server against the given store, with alice granted editor and
/// bob viewer on doc-1.
async fn start_server(mut config: ServerConfig, store: Arc<dyn StateStore>) -> TestServer {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");

    let validator = Arc::new(StaticTokenValidator::new());
    validator.register("alice-token-1", UserInfo::new("u-alice", "alice@lab.example", "Alice"));
    validator.register("bob-token-01", UserInfo::new("u-bob", "bob@lab.example", "Bob"));

    let permissions = Arc::new(InMemoryPermissionStore::new());
    permissions.grant("doc-1", "u-alice", PermissionLevel::Editor);
    permissions.grant("doc-1", "u-bob", PermissionLevel::Viewer);

    let server = CollabServer::new(config, validator, permissions, store);
    tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            let _ = server.run().await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer { server, url: format!("ws://127.0.0.1:{port}") }
}

async fn connect(url: &str) -> WsClient {
    connect_async(url).await.expect("should connect to server").0
}

async fn send_env(ws: &mut WsClient, env: Envelope) {
    ws.send(Message::Text(env.encode().unwrap().into())).await.unwrap();
}

async fn recv_kind(ws: &mut WsClient, kind: MessageKind) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = frame {
            let env = Envelope::decode(text.as_str()).unwrap();
            if env.kind == kind {
                return env;
            }
        }
    }
}

async fn auth_ok(ws: &mut WsClient, token: &str, document_id: &str) -> AuthSuccessPayload {
    send_env(ws, Envelope::auth(token, document_id)).await;
    recv_kind(ws, MessageKind::AuthSuccess).await.payload_as().unwrap()
}

fn text_update(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let mut txn = doc.transact_mut();
    let root = txn.get_or_insert_text("content");
    root.insert(&mut txn, 0, text);
    txn.encode_update_v1()
}

fn content_of(state: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let txn = doc.transact();
    txn.get_text("content").map(|t| t.get_string(&txn)).unwrap_or_default()
}

#[tokio::test]
async fn test_debounce_collapses_edits_into_one_save() {
    let store = Arc::new(MemoryStateStore::new());
    let config = ServerConfig {
        persist_debounce: Duration::from_millis(150),
        ..ServerConfig::default()
    };
    let ts = start_server(config, store.clone()).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;

    for text in ["a", "b", "c"] {
        send_env(&mut alice, Envelope::sync(text_update(text))).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(store.save_count(), 1);
    let saved = store.load_state("doc-1").await.unwrap().unwrap();
    let content = content_of(&saved);
    for text in ["a", "b", "c"] {
        assert!(content.contains(text), "{text} missing from {content}");
    }
}

#[tokio::test]
async fn test_last_disconnect_flushes_without_waiting_for_debounce() {
    let store = Arc::new(MemoryStateStore::new());
    // Debounce far longer than the test: any save we observe is the flush
    let config =
        ServerConfig { persist_debounce: Duration::from_secs(60), ..ServerConfig::default() };
    let ts = start_server(config, store.clone()).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    send_env(&mut alice, Envelope::sync(text_update("must survive"))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.save_count(), 0);

    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(store.save_count() >= 1);
    let saved = store.load_state("doc-1").await.unwrap().unwrap();
    assert_eq!(content_of(&saved), "must survive");
}

#[tokio::test]
async fn test_oversized_document_skips_save_but_stays_live() {
    let store = Arc::new(MemoryStateStore::new());
    let config = ServerConfig {
        persist_debounce: Duration::from_millis(100),
        // Any real update encodes larger than this
        max_document_size: 8,
        ..ServerConfig::default()
    };
    let ts = start_server(config, store.clone()).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    let mut bob = connect(&ts.url).await;
    auth_ok(&mut bob, "bob-token-01", "doc-1").await;

    // Live sync keeps working for connected clients
    let update = text_update("too big to persist");
    send_env(&mut alice, Envelope::sync(update.clone())).await;
    let env = recv_kind(&mut bob, MessageKind::SyncUpdate).await;
    let received: Vec<u8> = serde_json::from_value(env.payload).unwrap();
    assert_eq!(received, update);

    // The store is never called for the oversized state
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.save_count(), 0);
    assert_eq!(store.load_state("doc-1").await.unwrap(), None);
}

#[tokio::test]
async fn test_idle_unload_with_reuse_during_window() {
    let store = Arc::new(MemoryStateStore::new());
    let config = ServerConfig {
        persist_debounce: Duration::from_millis(100),
        idle_unload: Duration::from_millis(400),
        ..ServerConfig::default()
    };
    let ts = start_server(config, store.clone()).await;

    // First session: edit, then leave
    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    assert_eq!(store.load_count(), 1);
    send_env(&mut alice, Envelope::sync(text_update("hello"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Inside the idle window: still loaded, reconnect reuses the instance
    assert_eq!(ts.server.stats().await.document_count, 1);
    let mut alice = connect(&ts.url).await;
    let ack = auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    assert_eq!(content_of(&ack.initial_state), "hello");
    assert_eq!(store.load_count(), 1, "reconnect must not reload from the store");

    // Leave again and let the window elapse
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(ts.server.stats().await.document_count, 0);

    // A fresh connection reloads the flushed state from the store
    let mut alice = connect(&ts.url).await;
    let ack = auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    assert_eq!(store.load_count(), 2);
    assert_eq!(content_of(&ack.initial_state), "hello");
}

#[tokio::test]
async fn test_reconnect_during_window_cancels_nothing_but_unload_skips() {
    let store = Arc::new(MemoryStateStore::new());
    let config = ServerConfig {
        idle_unload: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let ts = start_server(config, store.clone()).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect before the timer fires and stay connected past it
    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The stale timer was a no-op: the document is still loaded and serving
    let stats = ts.server.stats().await;
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.total_connections, 1);
    send_env(&mut alice, Envelope::sync(text_update("still editable"))).await;
}

#[tokio::test]
async fn test_round_trip_through_rocks_store() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(RocksStateStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let config =
        ServerConfig { persist_debounce: Duration::from_millis(100), ..ServerConfig::default() };
    let ts = start_server(config, store.clone()).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    send_env(&mut alice, Envelope::sync(text_update("durable note"))).await;
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Fresh-instance load of what the flush wrote, byte-exact state
    let saved = store.load_state("doc-1").await.unwrap().expect("state must be persisted");
    assert_eq!(content_of(&saved), "durable note");

    let reread = store.load_state("doc-1").await.unwrap().unwrap();
    assert_eq!(saved, reread);
}

#[tokio::test]
async fn test_store_failure_never_reaches_clients() {
    use async_trait::async_trait;
    use labnote_collab::StoreError;

    /// Loads succeed (empty), saves always fail.
    struct BrokenSaves;

    #[async_trait]
    impl StateStore for BrokenSaves {
        async fn load_state(&self, _id: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }
        async fn save_state(&self, _id: &str, _state: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Database("store offline".to_string()))
        }
    }

    let config =
        ServerConfig { persist_debounce: Duration::from_millis(50), ..ServerConfig::default() };
    let ts = start_server(config, Arc::new(BrokenSaves)).await;

    let mut alice = connect(&ts.url).await;
    auth_ok(&mut alice, "alice-token-1", "doc-1").await;
    let mut bob = connect(&ts.url).await;
    auth_ok(&mut bob, "bob-token-01", "doc-1").await;

    // Saves fail in the background while editing continues undisturbed
    for text in ["one", "two", "three"] {
        send_env(&mut alice, Envelope::sync(text_update(text))).await;
        recv_kind(&mut bob, MessageKind::SyncUpdate).await;
    }

    // Persistence failures are operator-only: the editor never sees an error
    let unexpected = timeout(Duration::from_millis(400), async {
        loop {
            let frame = alice.next().await.unwrap().unwrap();
            if let Message::Text(text) = frame {
                let env = Envelope::decode(text.as_str()).unwrap();
                if env.kind == MessageKind::Error {
                    return env;
                }
            }
        }
    })
    .await;
    assert!(unexpected.is_err(), "store failures must never surface to clients");
}
