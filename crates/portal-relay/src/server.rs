//! TCP accept loop and WebSocket upgrade.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use portal_config::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::connection::handle_connection;
use crate::coordinator::CoordinatorHandle;

pub struct RelayServer {
    listener: TcpListener,
    handle: CoordinatorHandle,
    ws_path: String,
    outbound_queue: usize,
}

impl RelayServer {
    pub async fn bind(config: &ServerConfig, handle: CoordinatorHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            listener,
            handle,
            ws_path: config.ws_path.clone(),
            outbound_queue: config.outbound_queue as usize,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running until their sockets close.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down listener");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let handle = self.handle.clone();
                        let ws_path = self.ws_path.clone();
                        let queue = self.outbound_queue;
                        tokio::spawn(async move {
                            upgrade(stream, addr, ws_path, handle, queue).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP accept error");
                    }
                },
            }
        }
    }
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
    ws_path: String,
    handle: CoordinatorHandle,
    outbound_queue: usize,
) {
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            tracing::debug!(peer = %addr, path = %request.uri().path(), "Rejected upgrade for unknown path");
            let mut not_found = ErrorResponse::new(Some("Not found".into()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Err(not_found)
        }
    };

    match accept_hdr_async(stream, check_path).await {
        Ok(ws) => handle_connection(ws, addr, handle, outbound_queue).await,
        Err(e) => {
            tracing::debug!(peer = %addr, error = %e, "WS handshake failed");
        }
    }
}
