//! Session coordinator: the single task that owns routing tables and
//! session records.
//!
//! Connection tasks never touch shared state. They push
//! [`CoordinatorEvent`]s into one queue, and the coordinator handles them
//! one at a time, so each handler runs atomically with respect to the rest.

mod pairing;
mod relay;


use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portal_common::StoreError;
use tokio::sync::mpsc;

use crate::protocol::{encode, parse_frame, ClientMessage, ErrorCode, Frame, ServerMessage};
use crate::registry::{ConnId, ConnectionRegistry, Outbound, Outbox};
use crate::store::{Session, SessionStore};

/// Depth of the coordinator's inbound queue.
const INBOUND_CAPACITY: usize = 1024;

/// Events connection tasks feed to the coordinator.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Connected {
        conn: ConnId,
        addr: SocketAddr,
        outbox: Outbox,
    },
    Frame {
        conn: ConnId,
        text: String,
    },
    Disconnected {
        conn: ConnId,
    },
}

/// Durable-write tuning.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub write_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(2000),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl From<&portal_config::StoreConfig> for CoordinatorOptions {
    fn from(config: &portal_config::StoreConfig) -> Self {
        Self {
            write_timeout: Duration::from_millis(config.write_timeout_ms.into()),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms.into()),
        }
    }
}

/// Cloneable sender side of the coordinator queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorEvent>,
    next_conn: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Allocate an id for a newly accepted connection.
    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Enqueue an event. Fails only once the coordinator has stopped.
    pub async fn send(&self, event: CoordinatorEvent) -> Result<(), CoordinatorEvent> {
        self.tx.send(event).await.map_err(|e| e.0)
    }
}

pub struct Coordinator {
    registry: ConnectionRegistry,
    sessions: HashMap<String, Session>,
    store: Arc<dyn SessionStore>,
    options: CoordinatorOptions,
    rx: mpsc::Receiver<CoordinatorEvent>,
}

impl Coordinator {
    /// Build a coordinator over sessions already loaded from `store`.
    ///
    /// Taking the loaded map here is the startup gate: no registration can
    /// be processed before the load has finished.
    pub fn new(
        store: Arc<dyn SessionStore>,
        sessions: HashMap<String, Session>,
        options: CoordinatorOptions,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let coordinator = Self {
            registry: ConnectionRegistry::new(),
            sessions,
            store,
            options,
            rx,
        };
        let handle = CoordinatorHandle {
            tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        (coordinator, handle)
    }

    /// Build and run on a new task.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        sessions: HashMap<String, Session>,
        options: CoordinatorOptions,
    ) -> CoordinatorHandle {
        let (coordinator, handle) = Self::new(store, sessions, options);
        tokio::spawn(coordinator.run());
        handle
    }

    /// Process events until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(sessions = self.sessions.len(), "Coordinator started");
        while let Some(event) = self.rx.recv().await {
            self.handle_event(event).await;
        }
        tracing::info!("Coordinator stopped");
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected { conn, addr, outbox } => {
                tracing::debug!(%conn, peer = %addr, "Connection attached");
                self.registry.attach(conn, outbox);
            }
            CoordinatorEvent::Frame { conn, text } => self.handle_frame(conn, &text).await,
            CoordinatorEvent::Disconnected { conn } => self.handle_disconnect(conn),
        }
    }

    async fn handle_frame(&mut self, conn: ConnId, text: &str) {
        let inbound = match parse_frame(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(%conn, code = ?e.code, "Rejected frame: {}", e.message);
                self.send_error(conn, e.code, e.message);
                return;
            }
        };

        tracing::trace!(%conn, kind = %inbound.kind, "Frame");

        match inbound.message {
            ClientMessage::RegisterDesktop {
                device_name,
                pairing_code,
                pairing_passphrase,
                device_id,
                device_secret,
            } => {
                let reclaim = device_id.map(|id| (id, device_secret.unwrap_or_default()));
                self.register_desktop(conn, device_name, pairing_code, pairing_passphrase, reclaim)
                    .await
            }
            ClientMessage::RegisterMobile {
                device_name,
                pairing_passphrase,
            } => {
                self.register_mobile(conn, device_name, pairing_passphrase)
                    .await
            }
            ClientMessage::ResumeSession {
                session_token,
                device_name,
            } => self.resume_session(conn, session_token, device_name).await,
            ClientMessage::Unpair {
                session_token,
                device_id,
            } => self.unpair(conn, session_token, device_id).await,
            ClientMessage::Command {
                id,
                session_token,
                command,
                params,
            } => self.forward_command(conn, id, &session_token, command, params),
            ClientMessage::CommandResponse {
                request_id,
                success,
                result,
                error,
            } => self.broadcast_command_response(conn, request_id, success, result, error),
            ClientMessage::TerminalInput {
                session_token,
                terminal_id,
                data,
            } => self.forward_terminal_input(conn, &session_token, terminal_id, data),
            ClientMessage::TerminalOutput { terminal_id, data } => {
                self.broadcast_terminal_output(conn, terminal_id, data)
            }
            ClientMessage::StatusUpdate => self.broadcast_status(conn, &inbound.raw),
            ClientMessage::Ping { id } => self.pong(conn, id),
            // parse_frame turns Unknown into an UNKNOWN_MESSAGE error.
            ClientMessage::Unknown => {}
        }
    }

    /// Durably write `session`: bounded by the write timeout, retried once.
    async fn persist(&self, session: &Session) -> Result<(), StoreError> {
        match self.write_once(session).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    session = %short(&session.controller_id),
                    error = %first,
                    "Session write failed, retrying once"
                );
                tokio::time::sleep(self.options.retry_backoff).await;
                self.write_once(session).await
            }
        }
    }

    async fn write_once(&self, session: &Session) -> Result<(), StoreError> {
        let timeout = self.options.write_timeout;
        match tokio::time::timeout(timeout, self.store.put(session)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    /// Persist, or report PERSISTENCE_FAILED to `conn`. True on success.
    async fn persist_or_report(&self, conn: ConnId, session: &Session) -> bool {
        match self.persist(session).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    %conn,
                    session = %short(&session.controller_id),
                    error = %e,
                    "Session write failed, change discarded"
                );
                self.send_error(
                    conn,
                    ErrorCode::PersistenceFailed,
                    "Failed to save session state",
                );
                false
            }
        }
    }

    fn send(&self, conn: ConnId, message: &ServerMessage) {
        self.send_text(conn, encode(message));
    }

    fn send_text(&self, conn: ConnId, text: String) {
        if !self.registry.send(conn, Outbound::Text(text)) {
            tracing::debug!(%conn, "Dropped frame for closed connection");
        }
    }

    /// One serialization, many recipients.
    fn fan_out(&self, targets: &[ConnId], text: String) {
        for conn in targets {
            self.send_text(*conn, text.clone());
        }
    }

    fn send_error(&self, conn: ConnId, code: ErrorCode, message: impl Into<String>) {
        self.send(
            conn,
            &ServerMessage::Error {
                code,
                message: message.into(),
            },
        );
    }

    fn send_device_list(&self, conn: ConnId, session: &Session) {
        self.send(
            conn,
            &ServerMessage::DeviceList {
                devices: session.linked_subscribers.clone(),
            },
        );
    }

    fn pong(&self, conn: ConnId, id: Option<String>) {
        let pong = ServerMessage::Pong;
        let frame = match id {
            Some(id) => Frame::with_id(id, &pong),
            None => Frame::new(&pong),
        };
        self.send_text(conn, frame.to_json());
    }
}

/// Log-safe prefix of a secret or id.
pub(crate) fn short(value: &str) -> &str {
    match value.char_indices().nth(8) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
