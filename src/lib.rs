//! # labnote-collab — Real-time collaborative document sync service
//!
//! Keeps an authoritative, mergeable CRDT state in memory per document,
//! accepts many concurrent WebSocket connections, merges concurrent edits
//! deterministically, enforces per-user permission levels that can change
//! mid-session, and persists state durably without blocking live traffic.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                    ┌──────────────────┐
//!            ├─ ws ─► CollabServer│ DocumentRegistry │
//! Client B ──┘          │         │  doc_id → doc    │
//!                       │         └────────┬─────────┘
//!              TokenValidator              │
//!              PermissionOracle   ┌────────▼─────────┐
//!                (injected)       │ ManagedDocument  │
//!                                 │  Yrs Doc (auth.) │
//!                                 │  connections     │
//!                                 │  presence (eph.) │
//!                                 └────────┬─────────┘
//!                                          │ debounced
//!                                 ┌────────▼─────────┐
//!                                 │ StateStore       │
//!                                 │ (RocksDB / mem)  │
//!                                 └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and cause-specific close codes
//! - [`server`] — WebSocket accept loop and per-socket state machine
//! - [`document`] — per-document merge authority, presence, persistence
//! - [`registry`] — load-on-demand, single-flight, idle unload
//! - [`auth`] / [`permissions`] — injected collaborator interfaces
//! - [`persistence`] — snapshot store trait + RocksDB/in-memory backends
//!
//! The crate is a library: the embedding application supplies the token
//! validator, permission oracle, and state store, then runs the server.
//!
//! ```no_run
//! use std::sync::Arc;
//! use labnote_collab::{
//!     CollabServer, InMemoryPermissionStore, MemoryStateStore, PermissionLevel,
//!     ServerConfig, StaticTokenValidator, UserInfo,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let validator = Arc::new(StaticTokenValidator::new());
//!     validator.register("alice-token-1", UserInfo::new("u-alice", "alice@lab.example", "Alice"));
//!
//!     let permissions = Arc::new(InMemoryPermissionStore::new());
//!     permissions.grant("doc-1", "u-alice", PermissionLevel::Editor);
//!
//!     let server = CollabServer::new(
//!         ServerConfig::from_env()?,
//!         validator,
//!         permissions,
//!         Arc::new(MemoryStateStore::new()),
//!     );
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod document;
pub mod error;
pub mod permissions;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use auth::{user_color, StaticTokenValidator, TokenValidator, UserInfo};
pub use config::{ConfigError, ServerConfig};
pub use document::{ConnectionId, ConnectionInfo, ManagedDocument};
pub use error::{CollabError, ErrorCode};
pub use permissions::{
    InMemoryPermissionStore, PermissionCheck, PermissionLevel, PermissionOracle,
};
pub use persistence::{
    MemoryStateStore, RocksStateStore, StateStore, StoreConfig, StoreError,
};
pub use protocol::{
    close_code, close_message, AuthPayload, AuthSuccessPayload, AwarenessPayload, Envelope,
    ErrorPayload, MessageKind, SyncPayload,
};
pub use registry::{DocumentRegistry, RegistryStats};
pub use server::CollabServer;
