//! Message relaying between a desktop and its mobiles, and disconnect cleanup.

use serde_json::Value;

use super::{short, Coordinator};
use crate::protocol::{encode, ConnectionStatus, ErrorCode, Frame, ServerMessage};
use crate::registry::{ConnId, Role};

impl Coordinator {
    /// Controller-only messages from anyone else are dropped.
    fn require_controller(&self, conn: ConnId, kind: &str) -> bool {
        let is_controller = self
            .registry
            .connection(conn)
            .is_some_and(|c| c.role == Role::Controller);
        if !is_controller {
            tracing::debug!(%conn, kind, "Ignoring desktop-only message from non-desktop");
        }
        is_controller
    }

    fn controller_or_offline(&self, conn: ConnId, session_token: &str) -> Option<ConnId> {
        let controller = self.registry.controller_for_token(session_token);
        if controller.is_none() {
            tracing::debug!(%conn, session = %short(session_token), "No desktop for token");
            self.send_error(conn, ErrorCode::DesktopOffline, "Desktop is not connected");
        }
        controller
    }

    pub(super) fn forward_command(
        &self,
        conn: ConnId,
        id: String,
        session_token: &str,
        command: String,
        params: Value,
    ) {
        let Some(controller) = self.controller_or_offline(conn, session_token) else {
            return;
        };
        let requester_id = self.registry.connection(conn).map(|c| c.device_id.clone());
        let message = ServerMessage::Command {
            command,
            params,
            requester_id,
        };
        // The subscriber's id is the correlation id for the response.
        self.send_text(controller, Frame::with_id(id, &message).to_json());
    }

    pub(super) fn broadcast_command_response(
        &self,
        conn: ConnId,
        request_id: String,
        success: bool,
        result: Option<Value>,
        error: Option<Value>,
    ) {
        if !self.require_controller(conn, "command_response") {
            return;
        }
        let targets = self.registry.session_subscribers(conn);
        let text = encode(&ServerMessage::CommandResponse {
            request_id,
            success,
            result,
            error,
        });
        self.fan_out(&targets, text);
    }

    pub(super) fn forward_terminal_input(
        &self,
        conn: ConnId,
        session_token: &str,
        terminal_id: String,
        data: String,
    ) {
        let Some(controller) = self.controller_or_offline(conn, session_token) else {
            return;
        };
        self.send(controller, &ServerMessage::TerminalInput { terminal_id, data });
    }

    pub(super) fn broadcast_terminal_output(&self, conn: ConnId, terminal_id: String, data: String) {
        if !self.require_controller(conn, "terminal_output") {
            return;
        }
        let targets = self.registry.session_subscribers(conn);
        self.fan_out(
            &targets,
            encode(&ServerMessage::TerminalOutput { terminal_id, data }),
        );
    }

    /// Relayed as received.
    pub(super) fn broadcast_status(&self, conn: ConnId, raw: &Value) {
        if !self.require_controller(conn, "status_update") {
            return;
        }
        let targets = self.registry.session_subscribers(conn);
        self.fan_out(&targets, raw.to_string());
    }

    pub(super) fn handle_disconnect(&mut self, conn: ConnId) {
        let Some(departure) = self.registry.detach(conn) else {
            tracing::debug!(%conn, "Unregistered connection closed");
            return;
        };

        match departure.connection.role {
            Role::Controller => {
                tracing::info!(
                    %conn,
                    device = %short(&departure.connection.device_id),
                    notified = departure.orphaned.len(),
                    "Desktop disconnected"
                );
                let text = encode(&ServerMessage::StatusUpdate {
                    connection_status: ConnectionStatus::Disconnected,
                });
                self.fan_out(&departure.orphaned, text);
            }
            Role::Subscriber => {
                tracing::info!(
                    %conn,
                    device = %short(&departure.connection.device_id),
                    "Mobile disconnected"
                );
            }
        }
    }
}
