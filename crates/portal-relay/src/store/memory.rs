//! In-process session store. Nothing survives a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use portal_common::StoreError;
use tokio::sync::RwLock;

use super::{Session, SessionStore};

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    writes: AtomicUsize,
    failures_pending: AtomicU32,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing records, as if loaded from disk.
    pub fn with_sessions(sessions: HashMap<String, Session>) -> Self {
        Self {
            sessions: RwLock::new(sessions),
            ..Self::default()
        }
    }

    /// Make the next `count` writes fail. `u32::MAX` fails every write.
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn get(&self, controller_id: &str) -> Option<Session> {
        self.sessions.read().await.get(controller_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_all(&self) -> Result<HashMap<String, Session>, StoreError> {
        Ok(self.sessions.read().await.clone())
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            if pending != u32::MAX {
                self.failures_pending.store(pending - 1, Ordering::SeqCst);
            }
            return Err(StoreError::Unavailable("injected write failure".into()));
        }

        self.sessions
            .write()
            .await
            .insert(session.controller_id.clone(), session.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
