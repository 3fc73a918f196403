//! Permission levels and the permission oracle interface.
//!
//! Grant administration (invitations, role changes) is external; the service
//! consumes two things from it: point-in-time permission checks at connect
//! time, and a push channel of revocations so affected sessions can be
//! terminated promptly. A connection's level is fixed from the connect-time
//! snapshot — it is never downgraded in place, only revoked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Access tier for a document. Ordering is the permission lattice:
/// `Viewer < Editor < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Read-only access
    Viewer,
    /// Can edit content
    Editor,
    /// Full control, including permission management
    Owner,
}

impl PermissionLevel {
    pub fn can_write(&self) -> bool {
        matches!(self, PermissionLevel::Editor | PermissionLevel::Owner)
    }

    pub fn can_manage(&self) -> bool {
        matches!(self, PermissionLevel::Owner)
    }
}

/// Result of a permission lookup. `can_read` is false exactly when the user
/// holds no grant at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionCheck {
    pub can_read: bool,
    pub can_write: bool,
    pub can_manage: bool,
    pub permission_level: Option<PermissionLevel>,
}

impl PermissionCheck {
    pub fn from_level(level: Option<PermissionLevel>) -> Self {
        Self {
            can_read: level.is_some(),
            can_write: level.map(|l| l.can_write()).unwrap_or(false),
            can_manage: level.map(|l| l.can_manage()).unwrap_or(false),
            permission_level: level,
        }
    }

    pub fn denied() -> Self {
        Self::from_level(None)
    }
}

/// Source of permission decisions.
///
/// `subscribe_revocations` returns a channel that yields the user id of every
/// revocation on that document. Unsubscribing is dropping the receiver; the
/// oracle prunes dead subscriptions on the next notification.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn check_permission(&self, document_id: &str, user_id: &str) -> PermissionCheck;

    fn subscribe_revocations(&self, document_id: &str) -> mpsc::UnboundedReceiver<String>;
}

/// In-memory permission store: the oracle reference implementation.
///
/// Grants are keyed by `(document, user)`; revoking a grant also notifies
/// every live subscription for that document.
pub struct InMemoryPermissionStore {
    grants: Mutex<HashMap<String, HashMap<String, PermissionLevel>>>,
    listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl InMemoryPermissionStore {
    pub fn new() -> Self {
        Self { grants: Mutex::new(HashMap::new()), listeners: Mutex::new(HashMap::new()) }
    }

    /// Grant (or change) a user's level on a document.
    pub fn grant(&self, document_id: &str, user_id: &str, level: PermissionLevel) {
        if let Ok(mut grants) = self.grants.lock() {
            grants
                .entry(document_id.to_string())
                .or_default()
                .insert(user_id.to_string(), level);
        }
    }

    /// Remove a user's grant and push the revocation to subscribers.
    pub fn revoke(&self, document_id: &str, user_id: &str) {
        if let Ok(mut grants) = self.grants.lock() {
            if let Some(doc_grants) = grants.get_mut(document_id) {
                doc_grants.remove(user_id);
                if doc_grants.is_empty() {
                    grants.remove(document_id);
                }
            }
        }
        self.notify_revoked(document_id, user_id);
    }

    fn notify_revoked(&self, document_id: &str, user_id: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(senders) = listeners.get_mut(document_id) {
                // Dropped receivers are pruned here
                senders.retain(|tx| tx.send(user_id.to_string()).is_ok());
                if senders.is_empty() {
                    listeners.remove(document_id);
                }
            }
        }
    }
}

impl Default for InMemoryPermissionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionOracle for InMemoryPermissionStore {
    async fn check_permission(&self, document_id: &str, user_id: &str) -> PermissionCheck {
        let level = self
            .grants
            .lock()
            .ok()
            .and_then(|grants| grants.get(document_id).and_then(|d| d.get(user_id).copied()));
        PermissionCheck::from_level(level)
    }

    fn subscribe_revocations(&self, document_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.entry(document_id.to_string()).or_default().push(tx);
        }
        rx
    }
}
