//! Registration, pairing, resume and unpair.
//!
//! Every handler here that changes a session works on a copy, persists it,
//! and only then swaps it in and touches the routing tables. A failed write
//! leaves memory exactly as it was.

use portal_common::{
    is_valid_session_token, new_device_id, new_device_secret, new_session_token, now_millis,
};

use super::{short, Coordinator};
use crate::protocol::{ErrorCode, ServerMessage};
use crate::registry::{ConnId, Outbound, Role};
use crate::store::{DeviceKind, LinkedDevice, Session};

/// Close code sent to a subscriber that was unpaired.
const UNPAIRED_CLOSE_CODE: u16 = 1000;

impl Coordinator {
    fn role_of(&self, conn: ConnId) -> Option<Role> {
        self.registry.connection(conn).map(|c| c.role)
    }

    /// Legacy records without a secret cannot be reclaimed from a new socket.
    fn owns_controller(&self, controller_id: &str, secret: &str) -> bool {
        self.sessions.get(controller_id).is_some_and(|session| {
            !session.controller_secret.is_empty() && session.controller_secret == secret
        })
    }

    pub(super) async fn register_desktop(
        &mut self,
        conn: ConnId,
        device_name: String,
        pairing_code: String,
        passphrase: String,
        reclaim: Option<(String, String)>,
    ) {
        if self.role_of(conn) == Some(Role::Subscriber) {
            self.send_error(
                conn,
                ErrorCode::InvalidMessage,
                "Connection is already registered as a mobile device",
            );
            return;
        }

        // Same socket keeps its id. Another socket may take over a stored id
        // only with that desktop's secret, and only while it is offline.
        let current = self
            .registry
            .connection(conn)
            .map(|c| c.device_id.clone());
        let controller_id = match (current, reclaim) {
            (Some(id), _) => id,
            (None, Some((id, secret))) if self.sessions.contains_key(&id) => {
                if !self.owns_controller(&id, &secret) {
                    tracing::warn!(
                        %conn,
                        device = %short(&id),
                        "Desktop id presented without its secret"
                    );
                    self.send_error(
                        conn,
                        ErrorCode::InvalidToken,
                        "Desktop credentials rejected",
                    );
                    return;
                }
                if let Some(live) = self.registry.controller_for_device(&id) {
                    tracing::warn!(
                        %conn,
                        %live,
                        device = %short(&id),
                        "Desktop id is live on another connection"
                    );
                    self.send_error(
                        conn,
                        ErrorCode::InvalidMessage,
                        "Desktop is already connected",
                    );
                    return;
                }
                id
            }
            (None, Some((id, _))) => {
                tracing::debug!(%conn, device = %short(&id), "Unknown desktop id, assigning a new one");
                new_device_id()
            }
            (None, None) => new_device_id(),
        };

        let now = now_millis();
        let mut session = match self.sessions.get(&controller_id) {
            Some(existing) => {
                let mut session = existing.clone();
                session.controller_name = device_name.clone();
                session.pairing_code = pairing_code;
                session.pairing_passphrase = passphrase.clone();
                session.last_activity = now;
                session
            }
            None => Session::new(
                controller_id.clone(),
                device_name.clone(),
                pairing_code,
                passphrase.clone(),
                now,
            ),
        };
        if session.controller_secret.is_empty() {
            session.controller_secret = new_device_secret();
        }

        if !self.persist_or_report(conn, &session).await {
            return;
        }

        if let Some(shadowed) =
            self.registry
                .register_controller(conn, &controller_id, &device_name, &passphrase)
        {
            tracing::warn!(
                %conn,
                %shadowed,
                passphrase = %short(&passphrase),
                "Passphrase already announced by another desktop; latest registration wins"
            );
        }
        for issued in &session.issued_tokens {
            self.registry.route_token(&issued.token, conn);
        }

        tracing::info!(
            %conn,
            device = %short(&controller_id),
            linked = session.linked_subscribers.len(),
            "Desktop registered"
        );

        self.send(
            conn,
            &ServerMessage::RegisterDesktopResponse {
                success: true,
                device_id: controller_id.clone(),
                device_secret: session.controller_secret.clone(),
            },
        );
        self.send_device_list(conn, &session);

        // Subscribers that stayed connected through a desktop restart need
        // fresh state as soon as the desktop is back.
        let waiting: Vec<String> = session
            .issued_tokens
            .iter()
            .filter(|t| !self.registry.subscribers_of_token(&t.token).is_empty())
            .map(|t| t.token.clone())
            .collect();
        for session_token in waiting {
            self.send(conn, &ServerMessage::RequestStatus { session_token });
        }

        self.sessions.insert(controller_id, session);
    }

    pub(super) async fn register_mobile(
        &mut self,
        conn: ConnId,
        device_name: String,
        passphrase: String,
    ) {
        if self.role_of(conn) == Some(Role::Controller) {
            self.send_error(
                conn,
                ErrorCode::InvalidMessage,
                "Connection is already registered as a desktop",
            );
            return;
        }

        let Some(controller) = self.registry.controller_for_passphrase(&passphrase) else {
            tracing::debug!(%conn, passphrase = %short(&passphrase), "Pairing with unknown passphrase");
            self.send_error(conn, ErrorCode::InvalidPassphrase, "Invalid pairing passphrase");
            return;
        };
        let Some((controller_id, controller_name)) = self
            .registry
            .connection(controller)
            .map(|c| (c.device_id.clone(), c.device_name.clone()))
        else {
            self.send_error(conn, ErrorCode::DesktopNotFound, "Desktop not connected");
            return;
        };
        let Some(existing) = self.sessions.get(&controller_id) else {
            tracing::warn!(%conn, device = %short(&controller_id), "Live desktop has no session record");
            self.send_error(conn, ErrorCode::SessionNotFound, "Session not found");
            return;
        };

        let now = now_millis();
        let mobile_id = new_device_id();
        let session_token = new_session_token(&controller_id, &mobile_id, &passphrase);

        let mut session = existing.clone();
        session.link(
            LinkedDevice {
                id: mobile_id.clone(),
                name: device_name.clone(),
                kind: DeviceKind::Mobile,
                paired_at: now,
                last_seen: now,
            },
            session_token.clone(),
            now,
        );

        if !self.persist_or_report(conn, &session).await {
            return;
        }

        self.registry
            .register_subscriber(conn, &mobile_id, &device_name, &session_token);
        self.registry.route_token(&session_token, controller);

        tracing::info!(
            %conn,
            device = %short(&mobile_id),
            desktop = %short(&controller_id),
            session = %short(&session_token),
            "Mobile paired"
        );

        self.send(
            conn,
            &ServerMessage::PairResponse {
                success: true,
                session_token: session_token.clone(),
                desktop_device_id: controller_id.clone(),
                desktop_device_name: controller_name,
                mobile_device_id: mobile_id,
            },
        );
        self.send_device_list(controller, &session);
        self.send(controller, &ServerMessage::RequestStatus { session_token });

        self.sessions.insert(controller_id, session);
    }

    pub(super) async fn resume_session(
        &mut self,
        conn: ConnId,
        session_token: String,
        device_name: Option<String>,
    ) {
        if self.role_of(conn) == Some(Role::Controller) {
            self.send_error(
                conn,
                ErrorCode::InvalidMessage,
                "Connection is already registered as a desktop",
            );
            return;
        }
        if !is_valid_session_token(&session_token) {
            self.send_error(conn, ErrorCode::InvalidMessage, "Malformed session token");
            return;
        }

        let found = self.sessions.values().find_map(|s| {
            s.device_for_token(&session_token)
                .map(|d| (s.controller_id.clone(), d.id.clone()))
        });
        let Some((controller_id, mobile_id)) = found else {
            tracing::debug!(%conn, session = %short(&session_token), "Resume with unknown token");
            self.send_error(
                conn,
                ErrorCode::InvalidToken,
                "Unknown or revoked session token",
            );
            return;
        };
        let Some(controller) = self.registry.controller_for_device(&controller_id) else {
            self.send_error(conn, ErrorCode::DesktopOffline, "Desktop is not connected");
            return;
        };
        let Some(mut session) = self.sessions.get(&controller_id).cloned() else {
            return;
        };

        let now = now_millis();
        let mobile_name = match session.device_mut(&mobile_id) {
            Some(device) => {
                if let Some(name) = device_name {
                    device.name = name;
                }
                device.last_seen = now;
                device.name.clone()
            }
            None => return,
        };
        session.last_activity = now;

        if !self.persist_or_report(conn, &session).await {
            return;
        }

        self.registry
            .register_subscriber(conn, &mobile_id, &mobile_name, &session_token);
        self.registry.route_token(&session_token, controller);

        tracing::info!(
            %conn,
            device = %short(&mobile_id),
            session = %short(&session_token),
            "Mobile resumed session"
        );

        self.send(
            conn,
            &ServerMessage::PairResponse {
                success: true,
                session_token: session_token.clone(),
                desktop_device_id: controller_id.clone(),
                desktop_device_name: session.controller_name.clone(),
                mobile_device_id: mobile_id,
            },
        );
        self.send(controller, &ServerMessage::RequestStatus { session_token });

        self.sessions.insert(controller_id, session);
    }

    pub(super) async fn unpair(&mut self, conn: ConnId, session_token: String, device_id: String) {
        if self.registry.connection(conn).is_none() {
            tracing::debug!(%conn, "Ignoring unpair from unregistered connection");
            return;
        }

        // Linear in the number of sessions.
        let Some(mut session) = self
            .sessions
            .values()
            .find(|s| s.has_device(&device_id))
            .cloned()
        else {
            tracing::debug!(%conn, device = %short(&device_id), "Unpair for device that is not linked");
            return;
        };

        session.unlink(&device_id, now_millis());
        if !self.persist_or_report(conn, &session).await {
            return;
        }

        tracing::info!(
            %conn,
            device = %short(&device_id),
            desktop = %short(&session.controller_id),
            "Device unpaired"
        );

        let controller = self
            .registry
            .controller_for_device(&session.controller_id)
            .or_else(|| self.registry.controller_for_token(&session_token));
        if let Some(controller) = controller {
            self.send_device_list(controller, &session);
        }

        for (evicted, outbox) in self.registry.evict_device(&device_id) {
            tracing::debug!(conn = %evicted, "Closing unpaired connection");
            outbox.push(Outbound::Close {
                code: UNPAIRED_CLOSE_CODE,
                reason: "Unpaired".into(),
            });
        }

        self.sessions.insert(session.controller_id.clone(), session);
    }
}
