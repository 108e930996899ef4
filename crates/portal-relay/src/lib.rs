//! portal-relay: pairing and message relay between one desktop and its mobiles.
//!
//! A desktop announces a passphrase; mobiles that present it are paired into
//! the desktop's session and receive a session token. From then on the relay
//! forwards commands and terminal input to the desktop, and fans its output,
//! status and command responses out to every paired mobile.

pub mod connection;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;


use std::future::Future;
use std::sync::Arc;

use portal_config::{RelayConfig, StoreBackend, StoreConfig};

use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::server::RelayServer;
use crate::store::{FileSessionStore, MemorySessionStore, SessionStore};

/// Open the configured session store.
pub async fn open_store(config: &StoreConfig) -> portal_common::Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.backend {
        StoreBackend::File => {
            let dir = config.resolved_data_dir()?;
            tracing::info!(dir = %dir.display(), "Using file session store");
            Arc::new(FileSessionStore::open(&dir).await?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store; sessions are lost on restart");
            Arc::new(MemorySessionStore::new())
        }
    };
    Ok(store)
}

/// Load sessions, start the coordinator and bind the listener.
///
/// Sessions are fully loaded before the socket is bound, so no registration
/// can arrive ahead of them.
pub async fn bind(config: &RelayConfig) -> portal_common::Result<RelayServer> {
    let store = open_store(&config.store).await?;
    let sessions = store.load_all().await?;
    let handle = Coordinator::spawn(store, sessions, CoordinatorOptions::from(&config.store));
    Ok(RelayServer::bind(&config.server, handle).await?)
}

/// Serve until `shutdown` resolves.
pub async fn run<F>(config: &RelayConfig, shutdown: F) -> portal_common::Result<()>
where
    F: Future<Output = ()>,
{
    let server = bind(config).await?;
    tracing::info!(
        addr = %server.local_addr()?,
        path = %config.server.ws_path,
        "portal-relay listening"
    );
    server.run_until(shutdown).await;
    Ok(())
}
