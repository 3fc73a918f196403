//! Token validation interface.
//!
//! Token issuance lives with the identity provider; this service only
//! consumes verification. Deployments implement [`TokenValidator`] against
//! their provider and inject it into the server; [`StaticTokenValidator`]
//! is the in-memory reference implementation used by tests and small
//! embedded setups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::CollabError;

/// Verified user identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), email: email.into(), name: name.into(), avatar: None }
    }
}

/// Verifies an opaque credential into a user identity.
///
/// Failures carry `INVALID_TOKEN`, `TOKEN_EXPIRED`, or `SERVER_ERROR` codes;
/// the connection handler maps any of them to an error envelope plus an
/// unauthorized close.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<UserInfo, CollabError>;
}

/// In-memory token registry.
pub struct StaticTokenValidator {
    users: RwLock<HashMap<String, UserInfo>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self { users: RwLock::new(HashMap::new()) }
    }

    /// Register a token for a user. Re-registering a token replaces the user.
    pub fn register(&self, token: impl Into<String>, user: UserInfo) {
        if let Ok(mut users) = self.users.write() {
            users.insert(token.into(), user);
        }
    }
}

impl Default for StaticTokenValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate_token(&self, token: &str) -> Result<UserInfo, CollabError> {
        // Anything shorter than 10 chars cannot be a real credential
        if token.len() < 10 {
            return Err(CollabError::invalid_token("Token is missing or invalid"));
        }
        let users = self
            .users
            .read()
            .map_err(|_| CollabError::server_error("token registry unavailable"))?;
        users
            .get(token)
            .cloned()
            .ok_or_else(|| CollabError::invalid_token("Invalid token"))
    }
}

/// Cursor colors assigned to users, hashed from the user id so the same user
/// renders the same color on every client.
const USER_COLORS: [&str; 11] = [
    "#ef4444", "#f97316", "#f59e0b", "#84cc16", "#10b981", "#06b6d4", "#3b82f6", "#6366f1",
    "#8b5cf6", "#d946ef", "#f43f5e",
];

/// Deterministic display color for a user id.
pub fn user_color(user_id: &str) -> &'static str {
    let mut hash: i32 = 0;
    for c in user_id.chars() {
        hash = (c as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }
    USER_COLORS[hash.unsigned_abs() as usize % USER_COLORS.len()]
}
