//! WebSocket server and per-socket protocol state machine.
//!
//! ```text
//! Client ──ws──► CollabServer ──► DocumentRegistry ──► ManagedDocument
//!                    │                                      │
//!                    │ auth: TokenValidator +               ├─► StateStore
//!                    │       PermissionOracle               └─► sibling fan-out
//!                    └─ per-user connection cap
//! ```
//!
//! Socket lifecycle: `Connecting → Authenticating → Authenticated → Closed`.
//! A socket must authenticate within a fixed deadline; afterwards the main
//! loop multiplexes inbound frames, outbound fan-out, and heartbeats with
//! `tokio::select!`. Every exit path of an authenticated socket runs the same
//! cleanup: document disconnect, per-user slot release, unload scheduling.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{TokenValidator, UserInfo};
use crate::config::ServerConfig;
use crate::document::{ConnectionId, ConnectionInfo, ManagedDocument, SocketCommand};
use crate::error::CollabError;
use crate::permissions::{PermissionLevel, PermissionOracle};
use crate::persistence::StateStore;
use crate::protocol::{
    close_code, close_message, AuthPayload, AwarenessPayload, Envelope, MessageKind, SyncPayload,
};
use crate::registry::{DocumentRegistry, RegistryStats};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An authenticated socket's session state.
struct Session {
    conn_id: ConnectionId,
    document_id: String,
    user: UserInfo,
    permission_level: PermissionLevel,
    doc: Arc<ManagedDocument>,
    initial_state: Vec<u8>,
}

enum AuthStep {
    /// Not an auth message, or a recoverable protocol error; keep waiting
    Pending,
    /// Auth failed; error and close already sent
    Rejected,
    Authenticated(Session),
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    validator: Arc<dyn TokenValidator>,
    permissions: Arc<dyn PermissionOracle>,
    /// Live authenticated connections per user id, for the rate cap
    user_connections: Mutex<HashMap<String, usize>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        validator: Arc<dyn TokenValidator>,
        permissions: Arc<dyn PermissionOracle>,
        store: Arc<dyn StateStore>,
    ) -> Arc<Self> {
        let registry = DocumentRegistry::new(config.clone(), store, Arc::clone(&permissions));
        Arc::new(Self {
            config,
            registry,
            validator,
            permissions,
            user_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Monitoring read: `{documentCount, totalConnections}`.
    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::debug!("connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();
        log::debug!("new connection from {addr}");

        // Outbound queue; the document layer addresses this socket through it
        let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();

        // ── Authenticating ────────────────────────────────────────────────
        let session = match self.authenticate_socket(&mut sink, &mut source, &tx, addr).await? {
            Some(session) => session,
            None => return Ok(()),
        };

        // ── Authenticated ─────────────────────────────────────────────────
        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.dispatch(&session, text.as_str(), &mut sink).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let outcome = match String::from_utf8(bytes) {
                            Ok(text) => self.dispatch(&session, &text, &mut sink).await,
                            Err(_) => {
                                send_error(
                                    &mut sink,
                                    &CollabError::server_error("Failed to process message"),
                                )
                                .await
                            }
                        };
                        if outcome.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("socket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                cmd = rx.recv() => match cmd {
                    Some(SocketCommand::Send(msg)) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(SocketCommand::Close { code, reason }) => {
                        let _ = sink.send(close_message(code, &reason)).await;
                        break;
                    }
                    None => break,
                },

                _ = heartbeat.tick() => {
                    if pong_deadline.is_none() {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                        pong_deadline = Some(Instant::now() + self.config.heartbeat_grace);
                    }
                },

                // Armed only while a liveness probe is outstanding
                _ = async {
                    match pong_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    log::warn!(
                        "no heartbeat response from {addr} (user {}); terminating",
                        session.user.id
                    );
                    // Presumed dead: terminate without a close handshake
                    break;
                },
            }
        }

        // ── Closed ────────────────────────────────────────────────────────
        self.cleanup(&session).await;
        Ok(())
    }

    async fn authenticate_socket(
        self: &Arc<Self>,
        sink: &mut WsSink,
        source: &mut WsSource,
        tx: &mpsc::UnboundedSender<SocketCommand>,
        addr: SocketAddr,
    ) -> Result<Option<Session>, BoxError> {
        let deadline = tokio::time::sleep(self.config.auth_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::info!("authentication timeout from {addr}");
                    let _ = sink
                        .send(close_message(close_code::AUTH_TIMEOUT, "Authentication timeout"))
                        .await;
                    return Ok(None);
                }

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match self.process_auth_text(text.as_str(), sink, tx).await? {
                            AuthStep::Pending => {}
                            AuthStep::Rejected => return Ok(None),
                            AuthStep::Authenticated(session) => return Ok(Some(session)),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match String::from_utf8(bytes) {
                            Ok(text) => match self.process_auth_text(&text, sink, tx).await? {
                                AuthStep::Pending => {}
                                AuthStep::Rejected => return Ok(None),
                                AuthStep::Authenticated(session) => return Ok(Some(session)),
                            },
                            Err(_) => {
                                send_error(
                                    sink,
                                    &CollabError::server_error("Failed to process message"),
                                )
                                .await?;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Err(e)) => {
                        log::debug!("socket error from {addr} during auth: {e}");
                        return Ok(None);
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn process_auth_text(
        self: &Arc<Self>,
        text: &str,
        sink: &mut WsSink,
        tx: &mpsc::UnboundedSender<SocketCommand>,
    ) -> Result<AuthStep, BoxError> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(_) => {
                send_error(sink, &CollabError::server_error("Failed to process message")).await?;
                return Ok(AuthStep::Pending);
            }
        };

        if envelope.kind != MessageKind::Auth {
            send_error(sink, &CollabError::unauthorized("Not authenticated")).await?;
            return Ok(AuthStep::Pending);
        }

        match self.authenticate(envelope.payload, tx).await {
            Ok(mut session) => {
                // The state reply must precede anything queued by fan-out;
                // the outbound queue only drains once the main loop starts
                let initial_state = std::mem::take(&mut session.initial_state);
                let ack = Envelope::auth_success(
                    session.document_id.as_str(),
                    session.permission_level,
                    &session.user,
                    initial_state,
                );
                let sent: Result<(), BoxError> = match ack.to_message() {
                    Ok(msg) => sink.send(msg).await.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    // The connection is already registered; undo it
                    self.cleanup(&session).await;
                    return Err(e);
                }
                session.doc.seed_presence(session.conn_id).await;
                log::info!(
                    "user {} authenticated for document {}",
                    session.user.id,
                    session.document_id
                );
                Ok(AuthStep::Authenticated(session))
            }
            Err((err, code)) => {
                let _ = sink.send(Envelope::error(&err).to_message()?).await;
                let _ = sink.send(close_message(code, close_reason(code))).await;
                Ok(AuthStep::Rejected)
            }
        }
    }

    /// Token → rate cap → permission → document registration, in that order.
    /// Every failure maps to an error code plus a distinct close code.
    async fn authenticate(
        self: &Arc<Self>,
        payload: serde_json::Value,
        tx: &mpsc::UnboundedSender<SocketCommand>,
    ) -> Result<Session, (CollabError, u16)> {
        let auth: AuthPayload = serde_json::from_value(payload).map_err(|_| {
            (
                CollabError::invalid_token("Missing token or documentId"),
                close_code::UNAUTHORIZED,
            )
        })?;

        let user = self
            .validator
            .validate_token(&auth.token)
            .await
            .map_err(|e| (e, close_code::UNAUTHORIZED))?;

        // Reserve the slot before the remaining await points so concurrent
        // auths by the same user cannot slip past the cap together
        if !self.reserve_user_slot(&user.id).await {
            return Err((
                CollabError::rate_limited("Too many concurrent connections"),
                close_code::RATE_LIMITED,
            ));
        }

        let check = self.permissions.check_permission(&auth.document_id, &user.id).await;
        let permission_level = match (check.can_read, check.permission_level) {
            (true, Some(level)) => level,
            _ => {
                self.release_user_slot(&user.id).await;
                return Err((
                    CollabError::forbidden("Access denied to document"),
                    close_code::FORBIDDEN,
                ));
            }
        };

        let conn_id = Uuid::new_v4();
        let info = ConnectionInfo {
            user: user.clone(),
            permission_level,
            connected_at: std::time::SystemTime::now(),
            presence_key: Uuid::new_v4().as_u128() as u32,
            tx: tx.clone(),
        };

        match self.registry.connect(&auth.document_id, conn_id, info).await {
            Ok((doc, initial_state)) => Ok(Session {
                conn_id,
                document_id: auth.document_id,
                user,
                permission_level,
                doc,
                initial_state,
            }),
            Err(e) => {
                self.release_user_slot(&user.id).await;
                log::error!("failed to connect to document {}: {e}", auth.document_id);
                Err((
                    CollabError::server_error("Failed to load document"),
                    close_code::LOAD_FAILED,
                ))
            }
        }
    }

    /// Route an authenticated frame. Request-scoped failures answer the
    /// offending connection only.
    async fn dispatch(
        &self,
        session: &Session,
        text: &str,
        sink: &mut WsSink,
    ) -> Result<(), BoxError> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(_) => {
                return send_error(sink, &CollabError::server_error("Failed to process message"))
                    .await;
            }
        };

        match envelope.kind {
            MessageKind::Sync => match envelope.payload_as::<SyncPayload>() {
                Ok(payload) => {
                    if let Err(e) = session.doc.apply_sync(session.conn_id, &payload.update).await {
                        send_error(sink, &e).await?;
                    }
                }
                Err(_) => {
                    send_error(sink, &CollabError::server_error("Invalid sync payload")).await?;
                }
            },

            MessageKind::Awareness => match envelope.payload_as::<AwarenessPayload>() {
                Ok(payload) => {
                    if let Err(e) = session.doc.apply_awareness(session.conn_id, payload).await {
                        send_error(sink, &e).await?;
                    }
                }
                Err(_) => {
                    send_error(sink, &CollabError::server_error("Invalid awareness payload"))
                        .await?;
                }
            },

            MessageKind::Auth => {
                send_error(sink, &CollabError::server_error("Already authenticated")).await?;
            }

            _ => {
                send_error(sink, &CollabError::server_error("Unknown message type")).await?;
            }
        }
        Ok(())
    }

    async fn cleanup(&self, session: &Session) {
        session.doc.disconnect(session.conn_id).await;
        self.release_user_slot(&session.user.id).await;
        self.registry.handle_disconnect(&session.doc).await;
        log::debug!(
            "connection closed for user {} on document {}",
            session.user.id,
            session.document_id
        );
    }

    async fn reserve_user_slot(&self, user_id: &str) -> bool {
        let mut connections = self.user_connections.lock().await;
        let count = connections.entry(user_id.to_string()).or_insert(0);
        if *count >= self.config.max_connections_per_user {
            return false;
        }
        *count += 1;
        true
    }

    async fn release_user_slot(&self, user_id: &str) {
        let mut connections = self.user_connections.lock().await;
        if let Some(count) = connections.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(user_id);
            }
        }
    }
}

async fn send_error(sink: &mut WsSink, err: &CollabError) -> Result<(), BoxError> {
    sink.send(Envelope::error(err).to_message()?).await?;
    Ok(())
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close_code::UNAUTHORIZED => "Authentication failed",
        close_code::AUTH_TIMEOUT => "Authentication timeout",
        close_code::FORBIDDEN => "Access denied",
        close_code::LOAD_FAILED => "Document load failed",
        close_code::RATE_LIMITED => "Rate limited",
        close_code::PERMISSION_REVOKED => "Permission revoked",
        _ => "Closed",
    }
}
