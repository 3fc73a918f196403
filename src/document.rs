//! In-memory managed document: the single merge authority for one document id.
//!
//! All mutation of the CRDT state, the connection set, and the presence map
//! goes through one async mutex, so no two merges for the same document ever
//! interleave. Network I/O stays outside the critical section: fan-out is a
//! non-blocking push onto each sibling connection's outbound queue, which
//! also preserves the sender's per-document emission order. Merge
//! commutativity does the rest — receivers converge even when updates from
//! different senders arrive in different relative orders.
//!
//! Persistence is debounced: every merge arms a fresh timer and invalidates
//! the previous one (a stale timer is a no-op at fire time, nothing is
//! cancelled). A save already in flight queues at most one follow-up save.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::auth::{user_color, UserInfo};
use crate::error::CollabError;
use crate::permissions::PermissionLevel;
use crate::persistence::StateStore;
use crate::protocol::{close_code, now_millis, AwarenessPayload, Envelope};

/// Server-assigned identity of one live socket.
pub type ConnectionId = Uuid;

/// Outbound instruction for a connection's socket task.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    /// Queue a frame for delivery
    Send(Message),
    /// Send a close frame with the given code, then stop the socket
    Close { code: u16, reason: String },
}

/// A live connection registered on a document.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user: UserInfo,
    pub permission_level: PermissionLevel,
    pub connected_at: SystemTime,
    /// Ephemeral key owning this connection's presence entry
    pub presence_key: u32,
    pub(crate) tx: mpsc::UnboundedSender<SocketCommand>,
}

/// Marker returned when a connection races the idle unload; the registry
/// retries against a freshly loaded instance.
#[derive(Debug)]
pub(crate) struct Retired;

struct DocInner {
    doc: Doc,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// Ephemeral presence records, never persisted
    presence: HashMap<u32, Value>,
    last_modified: SystemTime,
    /// Set while the registry tears this instance down
    retired: bool,
}

/// The authoritative mergeable state for one document id, plus its live
/// connections, presence map, and persistence scheduling.
pub struct ManagedDocument {
    id: String,
    inner: Mutex<DocInner>,
    store: Arc<dyn StateStore>,
    persist_debounce: Duration,
    max_document_size: usize,
    /// Monotone edit counter; a debounce timer only fires for the newest edit
    persist_generation: AtomicU64,
    is_saving: AtomicBool,
    save_pending: AtomicBool,
    revocation_task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedDocument {
    pub(crate) fn new(
        id: String,
        initial_state: Option<Vec<u8>>,
        store: Arc<dyn StateStore>,
        persist_debounce: Duration,
        max_document_size: usize,
    ) -> Result<Arc<Self>, CollabError> {
        let doc = Doc::new();
        if let Some(bytes) = initial_state {
            let update = Update::decode_v1(&bytes)
                .map_err(|e| CollabError::server_error(format!("persisted state is corrupt: {e}")))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::server_error(format!("persisted state rejected: {e}")))?;
        }

        Ok(Arc::new(Self {
            id,
            inner: Mutex::new(DocInner {
                doc,
                connections: HashMap::new(),
                presence: HashMap::new(),
                last_modified: SystemTime::now(),
                retired: false,
            }),
            store,
            persist_debounce,
            max_document_size,
            persist_generation: AtomicU64::new(0),
            is_saving: AtomicBool::new(false),
            save_pending: AtomicBool::new(false),
            revocation_task: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drain the permission oracle's revocation channel for this document.
    /// The task is aborted on unload, which doubles as the unsubscribe.
    pub(crate) async fn attach_revocation_listener(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        let doc = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(user_id) = rx.recv().await {
                doc.revoke_user(&user_id).await;
            }
        });
        *self.revocation_task.lock().await = Some(handle);
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(handle) = self.revocation_task.lock().await.take() {
            handle.abort();
        }
    }

    /// Register a connection and return the full encoded document state.
    pub(crate) async fn connect(
        &self,
        conn_id: ConnectionId,
        info: ConnectionInfo,
    ) -> Result<Vec<u8>, Retired> {
        let mut inner = self.inner.lock().await;
        if inner.retired {
            return Err(Retired);
        }
        log::info!(
            "user {} connected to document {} as {:?}",
            info.user.id,
            self.id,
            info.permission_level
        );
        inner.connections.insert(conn_id, info);
        let txn = inner.doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Seed the connection's presence entry with its user profile and
    /// broadcast it, so every participant immediately sees who joined.
    pub(crate) async fn seed_presence(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        let (key, entry) = {
            let Some(info) = inner.connections.get(&conn_id) else { return };
            let mut user = serde_json::to_value(&info.user).unwrap_or(Value::Null);
            if let Value::Object(ref mut map) = user {
                map.insert("color".to_string(), json!(user_color(&info.user.id)));
            }
            (info.presence_key, json!({ "user": user, "lastActive": now_millis() }))
        };
        inner.presence.insert(key, entry.clone());
        Self::broadcast_awareness(&inner, &[(key, entry)]);
    }

    /// Merge an update from a connection and fan it out to every sibling.
    ///
    /// Read-only connections are rejected before any state is touched.
    pub(crate) async fn apply_sync(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        update_bytes: &[u8],
    ) -> Result<(), CollabError> {
        {
            let mut inner = self.inner.lock().await;
            let permission_level = inner
                .connections
                .get(&conn_id)
                .map(|info| info.permission_level)
                .ok_or_else(|| {
                    CollabError::server_error("connection is not registered with this document")
                })?;
            if !permission_level.can_write() {
                return Err(CollabError::forbidden("Viewers cannot edit documents"));
            }

            let update = Update::decode_v1(update_bytes)
                .map_err(|e| CollabError::server_error(format!("malformed update: {e}")))?;
            {
                let mut txn = inner.doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| CollabError::server_error(format!("failed to apply update: {e}")))?;
            }
            inner.last_modified = SystemTime::now();

            // Raw update bytes go to every sibling, never back to the sender
            if let Ok(msg) = Envelope::sync_update(update_bytes).to_message() {
                for (id, info) in &inner.connections {
                    if *id != conn_id {
                        let _ = info.tx.send(SocketCommand::Send(msg.clone()));
                    }
                }
            }
        }
        self.schedule_persist();
        Ok(())
    }

    /// Merge a presence update under this connection's ephemeral key and
    /// broadcast the changed entry to every connection, sender included.
    pub(crate) async fn apply_awareness(
        &self,
        conn_id: ConnectionId,
        payload: AwarenessPayload,
    ) -> Result<(), CollabError> {
        let mut inner = self.inner.lock().await;
        let key = inner
            .connections
            .get(&conn_id)
            .map(|info| info.presence_key)
            .ok_or_else(|| {
                CollabError::server_error("connection is not registered with this document")
            })?;

        if payload.states.is_empty() {
            return Ok(());
        }

        // Client-claimed keys are ignored: a connection owns exactly one entry
        let mut merged = inner.presence.remove(&key).unwrap_or_else(|| json!({}));
        for (_claimed_key, state) in payload.states {
            merge_presence(&mut merged, state);
        }
        inner.presence.insert(key, merged.clone());
        Self::broadcast_awareness(&inner, &[(key, merged)]);
        Ok(())
    }

    /// Remove a connection; returns the number of connections left.
    pub(crate) async fn disconnect(&self, conn_id: ConnectionId) -> usize {
        let mut inner = self.inner.lock().await;
        if let Some(info) = inner.connections.remove(&conn_id) {
            log::info!("user {} disconnected from document {}", info.user.id, self.id);
            if inner.presence.remove(&info.presence_key).is_some() {
                Self::broadcast_awareness(&inner, &[(info.presence_key, Value::Null)]);
            }
        }
        inner.connections.len()
    }

    /// Force-close every live connection of a user whose access was revoked.
    ///
    /// Connections are removed from the set before the sockets ever observe
    /// the close, so a racing `sync` from the revoked user fails the
    /// registration check and can never be applied.
    pub(crate) async fn revoke_user(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        let targets: Vec<ConnectionId> = inner
            .connections
            .iter()
            .filter(|(_, info)| info.user.id == user_id)
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            return;
        }

        log::info!(
            "permission revoked for user {user_id} on document {}; closing {} connection(s)",
            self.id,
            targets.len()
        );

        let notice = Envelope::permission_revoked("Your access to this document has been revoked");
        let mut removed = Vec::new();
        for conn_id in targets {
            if let Some(info) = inner.connections.remove(&conn_id) {
                if let Ok(msg) = notice.to_message() {
                    let _ = info.tx.send(SocketCommand::Send(msg));
                }
                let _ = info.tx.send(SocketCommand::Close {
                    code: close_code::PERMISSION_REVOKED,
                    reason: "Permission revoked".to_string(),
                });
                if inner.presence.remove(&info.presence_key).is_some() {
                    removed.push((info.presence_key, Value::Null));
                }
            }
        }
        if !removed.is_empty() {
            Self::broadcast_awareness(&inner, &removed);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn last_modified(&self) -> SystemTime {
        self.inner.lock().await.last_modified
    }

    /// Full document state encoded as a single update.
    pub async fn encode_state(&self) -> Vec<u8> {
        let inner = self.inner.lock().await;
        let txn = inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Mark this instance as going away iff it has no connections.
    pub(crate) async fn retire_if_idle(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.retired || !inner.connections.is_empty() {
            return false;
        }
        inner.retired = true;
        true
    }

    fn broadcast_awareness(inner: &DocInner, entries: &[(u32, Value)]) {
        if let Ok(msg) = Envelope::awareness_update(entries).to_message() {
            for info in inner.connections.values() {
                let _ = info.tx.send(SocketCommand::Send(msg.clone()));
            }
        }
    }

    /// Arm the debounce timer. Each call supersedes the previous one; a timer
    /// that wakes up superseded simply does nothing.
    pub(crate) fn schedule_persist(self: &Arc<Self>) {
        let generation = self.persist_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let doc = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(doc.persist_debounce).await;
            if doc.persist_generation.load(Ordering::SeqCst) == generation {
                doc.persist().await;
            }
        });
    }

    /// Persist immediately, bypassing the debounce window. Used on
    /// last-disconnect so a process restart loses as little as possible.
    pub(crate) fn persist_now(self: &Arc<Self>) {
        // Invalidate any armed debounce timer; this save covers it
        self.persist_generation.fetch_add(1, Ordering::SeqCst);
        let doc = Arc::clone(self);
        tokio::spawn(async move {
            doc.persist().await;
        });
    }

    /// Guarded save. A save requested while one is in flight queues exactly
    /// one follow-up save instead of being dropped, so the store never ends
    /// up more than one quiet-period behind the in-memory state.
    pub(crate) async fn persist(&self) {
        if self.is_saving.swap(true, Ordering::AcqRel) {
            self.save_pending.store(true, Ordering::Release);
            return;
        }
        loop {
            self.save_once().await;
            if !self.save_pending.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        self.is_saving.store(false, Ordering::Release);
    }

    async fn save_once(&self) {
        let state = self.encode_state().await;
        if state.len() > self.max_document_size {
            // Live service continues on the in-memory state; durability is at
            // risk until the document shrinks or an operator intervenes.
            log::error!(
                "document {} exceeds max persisted size ({} > {} bytes); skipping save",
                self.id,
                state.len(),
                self.max_document_size
            );
            return;
        }
        match self.store.save_state(&self.id, &state).await {
            Ok(()) => log::debug!("persisted document {} ({} bytes)", self.id, state.len()),
            Err(e) => log::error!("failed to persist document {}: {e}", self.id),
        }
    }
}

/// Shallow-merge an incoming presence state into the existing entry.
/// Non-object states replace the entry outright.
fn merge_presence(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(update)) => {
            for (k, v) in update {
                base.insert(k, v);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}
