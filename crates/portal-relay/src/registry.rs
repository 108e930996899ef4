//! Runtime connection registry and routing tables.
//!
//! Owned by the coordinator and touched only from its task. Every entry
//! names a live connection; [`ConnectionRegistry::detach`] drops all of a
//! connection's entries in one step, so nothing goes stale.
//!
//! A controller's session spans every token minted for it; fan-out goes
//! to the union of the subscriber sets of those tokens.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Process-local connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Role of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Subscriber,
}

/// Metadata for a connection that completed registration.
#[derive(Debug, Clone)]
pub struct Connection {
    pub role: Role,
    pub device_id: String,
    pub device_name: String,
    /// Subscribers only: the token they joined with.
    pub session_token: Option<String>,
}

/// Items queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    kill: CancellationToken,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Outbound>, kill: CancellationToken) -> Self {
        Self { tx, kill }
    }

    /// Queue without waiting. A connection whose queue is full is cut off
    /// rather than silently losing frames.
    pub fn push(&self, item: Outbound) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue full, dropping connection");
                self.kill.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// What a departing connection leaves behind.
#[derive(Debug)]
pub struct Departure {
    pub connection: Connection,
    /// Controllers only: subscribers that were receiving its fan-out.
    pub orphaned: Vec<ConnId>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Live sockets, registered or not.
    peers: HashMap<ConnId, Outbox>,
    /// Registered connections.
    connections: HashMap<ConnId, Connection>,
    controller_by_passphrase: HashMap<String, ConnId>,
    controller_by_device: HashMap<String, ConnId>,
    controller_by_token: HashMap<String, ConnId>,
    tokens_by_controller: HashMap<ConnId, HashSet<String>>,
    subscribers_by_token: HashMap<String, HashSet<ConnId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted socket.
    pub fn attach(&mut self, conn: ConnId, outbox: Outbox) {
        self.peers.insert(conn, outbox);
    }

    pub fn connection(&self, conn: ConnId) -> Option<&Connection> {
        self.connections.get(&conn)
    }

    pub fn live_count(&self) -> usize {
        self.peers.len()
    }

    /// Queue a frame for one connection. False if it is gone or cut off.
    pub fn send(&self, conn: ConnId, item: Outbound) -> bool {
        match self.peers.get(&conn) {
            Some(outbox) => outbox.push(item),
            None => false,
        }
    }

    /// Register `conn` as the controller for `device_id` announcing `passphrase`.
    ///
    /// Returns the controller connection previously routed by this passphrase,
    /// if a different one was shadowed.
    pub fn register_controller(
        &mut self,
        conn: ConnId,
        device_id: &str,
        device_name: &str,
        passphrase: &str,
    ) -> Option<ConnId> {
        // A re-registering socket gives up its old passphrase and identity.
        self.controller_by_passphrase.retain(|_, c| *c != conn);
        self.controller_by_device.retain(|_, c| *c != conn);

        self.connections.insert(
            conn,
            Connection {
                role: Role::Controller,
                device_id: device_id.to_string(),
                device_name: device_name.to_string(),
                session_token: None,
            },
        );
        self.controller_by_device.insert(device_id.to_string(), conn);
        self.controller_by_passphrase
            .insert(passphrase.to_string(), conn)
            .filter(|previous| *previous != conn)
    }

    /// Register `conn` as a subscriber that joined with `token`.
    pub fn register_subscriber(
        &mut self,
        conn: ConnId,
        device_id: &str,
        device_name: &str,
        token: &str,
    ) {
        if let Some(previous) = self.connections.get(&conn).and_then(|c| c.session_token.clone()) {
            self.leave_token(conn, &previous);
        }
        self.connections.insert(
            conn,
            Connection {
                role: Role::Subscriber,
                device_id: device_id.to_string(),
                device_name: device_name.to_string(),
                session_token: Some(token.to_string()),
            },
        );
        self.subscribers_by_token
            .entry(token.to_string())
            .or_default()
            .insert(conn);
    }

    /// Route `token` to controller connection `controller`.
    pub fn route_token(&mut self, token: &str, controller: ConnId) {
        if let Some(previous) = self
            .controller_by_token
            .insert(token.to_string(), controller)
        {
            if previous != controller {
                if let Some(tokens) = self.tokens_by_controller.get_mut(&previous) {
                    tokens.remove(token);
                }
            }
        }
        self.tokens_by_controller
            .entry(controller)
            .or_default()
            .insert(token.to_string());
    }

    pub fn controller_for_passphrase(&self, passphrase: &str) -> Option<ConnId> {
        self.controller_by_passphrase.get(passphrase).copied()
    }

    pub fn controller_for_token(&self, token: &str) -> Option<ConnId> {
        self.controller_by_token.get(token).copied()
    }

    pub fn controller_for_device(&self, device_id: &str) -> Option<ConnId> {
        self.controller_by_device.get(device_id).copied()
    }

    /// Subscribers live on `token`, in connection order.
    pub fn subscribers_of_token(&self, token: &str) -> Vec<ConnId> {
        self.subscribers_by_token
            .get(token)
            .map(|set| {
                let mut v: Vec<ConnId> = set.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default()
    }

    /// Every subscriber connection in `controller`'s session, each once.
    pub fn session_subscribers(&self, controller: ConnId) -> Vec<ConnId> {
        let mut out = BTreeSet::new();
        if let Some(tokens) = self.tokens_by_controller.get(&controller) {
            for token in tokens {
                if let Some(subs) = self.subscribers_by_token.get(token) {
                    out.extend(subs.iter().copied());
                }
            }
        }
        out.into_iter().collect()
    }

    /// Detach every live subscriber registered under `device_id`.
    ///
    /// Returns their outboxes so the caller can close them. The connections
    /// stay attached as unregistered sockets until their tasks exit.
    pub fn evict_device(&mut self, device_id: &str) -> Vec<(ConnId, Outbox)> {
        let matching: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.role == Role::Subscriber && c.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::with_capacity(matching.len());
        for conn in matching {
            if let Some(connection) = self.connections.remove(&conn) {
                if let Some(token) = connection.session_token {
                    self.leave_token(conn, &token);
                }
            }
            if let Some(outbox) = self.peers.get(&conn) {
                evicted.push((conn, outbox.clone()));
            }
        }
        evicted
    }

    /// Forget a closed socket and every routing entry naming it.
    pub fn detach(&mut self, conn: ConnId) -> Option<Departure> {
        self.peers.remove(&conn);
        let connection = self.connections.remove(&conn)?;

        let orphaned = match connection.role {
            Role::Controller => {
                let orphaned = self.session_subscribers(conn);
                self.controller_by_passphrase.retain(|_, c| *c != conn);
                self.controller_by_device.retain(|_, c| *c != conn);
                if let Some(tokens) = self.tokens_by_controller.remove(&conn) {
                    for token in tokens {
                        if self.controller_by_token.get(&token) == Some(&conn) {
                            self.controller_by_token.remove(&token);
                        }
                    }
                }
                orphaned
            }
            Role::Subscriber => {
                if let Some(token) = &connection.session_token {
                    self.leave_token(conn, token);
                }
                Vec::new()
            }
        };

        Some(Departure {
            connection,
            orphaned,
        })
    }

    fn leave_token(&mut self, conn: ConnId, token: &str) {
        if let Some(subs) = self.subscribers_by_token.get_mut(token) {
            subs.remove(&conn);
            if subs.is_empty() {
                self.subscribers_by_token.remove(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        (Outbox::new(tx, CancellationToken::new()), rx)
    }

    fn attach(reg: &mut ConnectionRegistry, id: u64) -> mpsc::Receiver<Outbound> {
        let (out, rx) = outbox();
        reg.attach(ConnId(id), out);
        rx
    }

    #[test]
    fn controller_registration_indexes_passphrase_and_device() {
        let mut reg = ConnectionRegistry::new();
        let _rx = attach(&mut reg, 1);

        assert!(reg
            .register_controller(ConnId(1), "desk", "Desk", "apple")
            .is_none());
        assert_eq!(reg.controller_for_passphrase("apple"), Some(ConnId(1)));
        assert_eq!(reg.controller_for_device("desk"), Some(ConnId(1)));
        assert_eq!(reg.connection(ConnId(1)).unwrap().role, Role::Controller);
    }

    #[test]
    fn later_controller_shadows_passphrase() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "d1", "One", "apple");
        let shadowed = reg.register_controller(ConnId(2), "d2", "Two", "apple");

        assert_eq!(shadowed, Some(ConnId(1)));
        assert_eq!(reg.controller_for_passphrase("apple"), Some(ConnId(2)));
    }

    #[test]
    fn re_registration_drops_old_passphrase() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "d1", "One", "apple");
        let shadowed = reg.register_controller(ConnId(1), "d1", "One", "banana");

        assert!(shadowed.is_none());
        assert!(reg.controller_for_passphrase("apple").is_none());
        assert_eq!(reg.controller_for_passphrase("banana"), Some(ConnId(1)));
    }

    #[test]
    fn session_subscribers_span_all_tokens_once() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "desk", "Desk", "apple");
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t1");
        reg.route_token("t1", ConnId(1));
        reg.register_subscriber(ConnId(3), "m2", "Tablet", "t2");
        reg.route_token("t2", ConnId(1));

        assert_eq!(reg.session_subscribers(ConnId(1)), vec![ConnId(2), ConnId(3)]);
        assert_eq!(reg.controller_for_token("t2"), Some(ConnId(1)));
    }

    #[test]
    fn subscriber_detach_leaves_controller_routes() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "desk", "Desk", "apple");
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t1");
        reg.route_token("t1", ConnId(1));

        let departure = reg.detach(ConnId(2)).unwrap();
        assert_eq!(departure.connection.role, Role::Subscriber);
        assert!(departure.orphaned.is_empty());
        assert!(reg.session_subscribers(ConnId(1)).is_empty());
        assert!(reg.subscribers_of_token("t1").is_empty());
        assert_eq!(reg.controller_for_token("t1"), Some(ConnId(1)));
    }

    #[test]
    fn controller_detach_clears_every_route() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "desk", "Desk", "apple");
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t1");
        reg.route_token("t1", ConnId(1));

        let departure = reg.detach(ConnId(1)).unwrap();
        assert_eq!(departure.orphaned, vec![ConnId(2)]);
        assert!(reg.controller_for_passphrase("apple").is_none());
        assert!(reg.controller_for_token("t1").is_none());
        assert!(reg.controller_for_device("desk").is_none());
        // Subscriber is still live and still on its token.
        assert_eq!(reg.subscribers_of_token("t1"), vec![ConnId(2)]);
    }

    #[test]
    fn stale_controller_detach_keeps_newer_routes() {
        let mut reg = ConnectionRegistry::new();
        reg.register_controller(ConnId(1), "desk", "Desk", "apple");
        reg.route_token("t1", ConnId(1));
        // Same controller identity reconnects on a new socket.
        reg.register_controller(ConnId(5), "desk", "Desk", "banana");
        reg.route_token("t1", ConnId(5));

        reg.detach(ConnId(1));
        assert_eq!(reg.controller_for_token("t1"), Some(ConnId(5)));
        assert_eq!(reg.controller_for_device("desk"), Some(ConnId(5)));
        assert_eq!(reg.controller_for_passphrase("banana"), Some(ConnId(5)));
    }

    #[test]
    fn unregistered_detach_returns_none() {
        let mut reg = ConnectionRegistry::new();
        let _rx = attach(&mut reg, 9);
        assert_eq!(reg.live_count(), 1);
        assert!(reg.detach(ConnId(9)).is_none());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn evict_device_removes_all_matching_subscribers() {
        let mut reg = ConnectionRegistry::new();
        let _r2 = attach(&mut reg, 2);
        let _r3 = attach(&mut reg, 3);
        let _r4 = attach(&mut reg, 4);
        reg.register_controller(ConnId(1), "desk", "Desk", "apple");
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t1");
        reg.register_subscriber(ConnId(3), "m1", "Phone", "t1");
        reg.register_subscriber(ConnId(4), "m2", "Tablet", "t2");
        reg.route_token("t1", ConnId(1));
        reg.route_token("t2", ConnId(1));

        let evicted: Vec<ConnId> = reg.evict_device("m1").into_iter().map(|(c, _)| c).collect();
        assert_eq!(evicted.len(), 2);
        assert_eq!(reg.session_subscribers(ConnId(1)), vec![ConnId(4)]);
        assert!(reg.connection(ConnId(2)).is_none());
        // Still attached as a bare socket.
        assert_eq!(reg.live_count(), 3);
    }

    #[test]
    fn resubscribe_moves_connection_between_tokens() {
        let mut reg = ConnectionRegistry::new();
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t1");
        reg.register_subscriber(ConnId(2), "m1", "Phone", "t2");

        assert!(reg.subscribers_of_token("t1").is_empty());
        assert_eq!(reg.subscribers_of_token("t2"), vec![ConnId(2)]);
    }

    #[test]
    fn send_to_unknown_connection_fails() {
        let reg = ConnectionRegistry::new();
        assert!(!reg.send(ConnId(1), Outbound::Text("x".into())));
    }

    #[tokio::test]
    async fn full_queue_cuts_connection_off() {
        let (tx, mut rx) = mpsc::channel(1);
        let kill = CancellationToken::new();
        let outbox = Outbox::new(tx, kill.clone());

        assert!(outbox.push(Outbound::Text("a".into())));
        assert!(!outbox.push(Outbound::Text("b".into())));
        assert!(kill.is_cancelled());
        assert_eq!(rx.recv().await, Some(Outbound::Text("a".into())));
    }
}
