//! Document registry: load-on-demand, idle unload, and monitoring stats.
//!
//! One `ManagedDocument` instance per document id, ever. Loads are
//! single-flight: concurrent `get_or_load` calls for one unseen id share a
//! per-entry `OnceCell`, so the store is read exactly once, and the map lock
//! is only held long enough to clone the cell — a slow load for document A
//! never stalls document B.
//!
//! Unloading is a fire-time check, not a cancellation: when the idle timer
//! wakes it re-checks the connection count under both the registry lock and
//! the document lock, marks the instance retired, and only then removes it.
//! A connection that raced the teardown sees the retired marker and is
//! retried by [`DocumentRegistry::connect`] against a fresh instance.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

use crate::config::ServerConfig;
use crate::document::{ConnectionId, ConnectionInfo, ManagedDocument};
use crate::error::CollabError;
use crate::permissions::PermissionOracle;
use crate::persistence::StateStore;

/// Monitoring snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub document_count: usize,
    pub total_connections: usize,
}

type DocCell = Arc<OnceCell<Arc<ManagedDocument>>>;

/// Owns every in-memory document instance in this process.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, DocCell>>,
    store: Arc<dyn StateStore>,
    permissions: Arc<dyn PermissionOracle>,
    config: ServerConfig,
}

impl DocumentRegistry {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn StateStore>,
        permissions: Arc<dyn PermissionOracle>,
    ) -> Arc<Self> {
        Arc::new(Self { docs: RwLock::new(HashMap::new()), store, permissions, config })
    }

    /// Existing instance, or a freshly loaded one (single-flight).
    pub async fn get_or_load(
        self: &Arc<Self>,
        document_id: &str,
    ) -> Result<Arc<ManagedDocument>, CollabError> {
        let cell = {
            let docs = self.docs.read().await;
            docs.get(document_id).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut docs = self.docs.write().await;
                docs.entry(document_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        let result = cell
            .get_or_try_init(|| async {
                log::info!("loading document {document_id}");
                let persisted = self.store.load_state(document_id).await.map_err(|e| {
                    CollabError::server_error(format!("failed to load document state: {e}"))
                })?;
                if persisted.is_some() {
                    log::info!("loaded persisted state for document {document_id}");
                }
                let doc = ManagedDocument::new(
                    document_id.to_string(),
                    persisted,
                    Arc::clone(&self.store),
                    self.config.persist_debounce,
                    self.config.max_document_size,
                )?;
                let rx = self.permissions.subscribe_revocations(document_id);
                doc.attach_revocation_listener(rx).await;
                Ok::<_, CollabError>(doc)
            })
            .await;

        match result {
            Ok(doc) => Ok(Arc::clone(doc)),
            Err(e) => {
                // Evict the failed cell so a later attempt can retry the load
                let mut docs = self.docs.write().await;
                if let Some(existing) = docs.get(document_id) {
                    if Arc::ptr_eq(existing, &cell) && existing.get().is_none() {
                        docs.remove(document_id);
                    }
                }
                log::error!("failed to load document {document_id}: {e}");
                Err(e)
            }
        }
    }

    /// Load (if needed) and register a connection in one step.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        document_id: &str,
        conn_id: ConnectionId,
        info: ConnectionInfo,
    ) -> Result<(Arc<ManagedDocument>, Vec<u8>), CollabError> {
        // Two attempts: the second can only race a teardown that the first
        // one triggered past, and it always sees a fresh instance.
        for _ in 0..2 {
            let doc = self.get_or_load(document_id).await?;
            match doc.connect(conn_id, info.clone()).await {
                Ok(state) => return Ok((doc, state)),
                Err(_retired) => continue,
            }
        }
        Err(CollabError::server_error("document is reloading"))
    }

    /// Unload-scheduling path, called whenever a socket goes away.
    ///
    /// At zero connections the document is flushed immediately and an idle
    /// timer armed; nothing is cancelled if the document is picked back up —
    /// the timer re-checks at fire time.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, doc: &Arc<ManagedDocument>) {
        if doc.connection_count().await > 0 {
            return;
        }
        doc.persist_now();

        let registry = Arc::clone(self);
        let document_id = doc.id().to_string();
        let idle = self.config.idle_unload;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            registry.unload_if_idle(&document_id).await;
        });
    }

    async fn unload_if_idle(self: &Arc<Self>, document_id: &str) {
        let doc = {
            let mut docs = self.docs.write().await;
            let Some(cell) = docs.get(document_id) else { return };
            let Some(doc) = cell.get().cloned() else { return };
            if !doc.retire_if_idle().await {
                // Reconnected during the idle window; instance stays
                return;
            }
            docs.remove(document_id);
            doc
        };

        log::info!("unloading idle document {document_id}");
        doc.persist().await;
        doc.shutdown().await;
    }

    /// Monitoring read; no side effects.
    pub async fn stats(&self) -> RegistryStats {
        let docs: Vec<Arc<ManagedDocument>> = {
            let map = self.docs.read().await;
            map.values().filter_map(|cell| cell.get().cloned()).collect()
        };
        let mut total_connections = 0;
        for doc in &docs {
            total_connections += doc.connection_count().await;
        }
        RegistryStats { document_count: docs.len(), total_connections }
    }
}
