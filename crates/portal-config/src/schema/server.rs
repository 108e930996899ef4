use serde::{Deserialize, Serialize};

/// Listener configuration for the WebSocket front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind: String,
    /// TCP port. 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Only upgrade requests for this path are accepted.
    pub ws_path: String,
    /// Per-connection outbound queue depth (valid range: 16-65536).
    pub outbound_queue: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8787,
            ws_path: "/ws".into(),
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    /// `bind:port` in a form `TcpListener::bind` accepts.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
