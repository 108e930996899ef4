//! JSON-file session store: `<data_dir>/sessions/<controllerId>.json`.
//!
//! Each put writes a uniquely named temp file and renames it over the record.
//! The rename happens under one commit lock and only if the caller is still
//! waiting, so a put that was given up on cannot land after a later one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use portal_common::StoreError;

use super::{Session, SessionStore};

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

pub struct FileSessionStore {
    dir: PathBuf,
    seq: AtomicU64,
    commit: Arc<Mutex<()>>,
}

impl FileSessionStore {
    /// Open (and create if needed) the session directory under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("sessions");
        tokio::fs::create_dir_all(&dir).await?;

        // Leftovers from puts that never committed.
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove stale temp file");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), "Session store opened");
        Ok(Self {
            dir,
            seq: AtomicU64::new(0),
            commit: Arc::new(Mutex::new(())),
        })
    }

    fn record_path(&self, controller_id: &str) -> Result<PathBuf, StoreError> {
        // Ids become file names; only accept what new_device_id produces.
        if controller_id.is_empty() || !controller_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StoreError::Unavailable(format!(
                "refusing to store session with id {controller_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{controller_id}.json")))
    }

    fn temp_path(&self, controller_id: &str) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{controller_id}.json.{seq}.tmp"))
    }
}

/// Marks the put abandoned if its future is dropped before the write
/// reports back, e.g. by a timeout.
struct AbandonOnDrop {
    state: Arc<AtomicU8>,
    armed: bool,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let abandoned = self
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !abandoned {
            tracing::warn!("Session write was already committing when its caller gave up");
        }
    }
}

/// Blocking half of a put: write the temp file, then rename it into place
/// unless the caller has gone away.
fn write_record(
    tmp: &Path,
    path: &Path,
    json: &[u8],
    commit: &Mutex<()>,
    state: &AtomicU8,
) -> Result<(), StoreError> {
    if let Err(e) = std::fs::write(tmp, json) {
        let _ = std::fs::remove_file(tmp);
        return Err(e.into());
    }

    let _commit = commit.lock().unwrap_or_else(PoisonError::into_inner);
    if state
        .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        let _ = std::fs::remove_file(tmp);
        tracing::debug!(path = %path.display(), "Dropped abandoned session write");
        return Err(StoreError::Unavailable("write abandoned".into()));
    }
    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load_all(&self) -> Result<HashMap<String, Session>, StoreError> {
        let mut sessions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Session>(&data) {
                Ok(session) => {
                    sessions.insert(session.controller_id.clone(), session);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }

        tracing::info!(sessions = sessions.len(), "Loaded session records");
        Ok(sessions)
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.record_path(&session.controller_id)?;
        let tmp = self.temp_path(&session.controller_id);
        let json = serde_json::to_vec_pretty(session)?;

        let state = Arc::new(AtomicU8::new(PENDING));
        let mut guard = AbandonOnDrop {
            state: state.clone(),
            armed: true,
        };
        let commit = self.commit.clone();
        let joined = tokio::task::spawn_blocking(move || {
            write_record(&tmp, &path, &json, &commit, &state)
        })
        .await;
        guard.armed = false;

        joined.map_err(|e| StoreError::Unavailable(format!("write task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{DeviceKind, LinkedDevice};

    fn temp_files(data_dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(data_dir.join("sessions"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .collect()
    }

    fn session(id: &str) -> Session {
        let mut s = Session::new(
            id.into(),
            "Workstation".into(),
            "000042".into(),
            "apple-banana-cherry-dragon-eagle-falcon".into(),
            100,
        );
        s.link(
            LinkedDevice {
                id: "phone1".into(),
                name: "Phone".into(),
                kind: DeviceKind::Mobile,
                paired_at: 101,
                last_seen: 101,
            },
            "ab".repeat(32),
            101,
        );
        s
    }

    #[tokio::test]
    async fn put_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();

        store.put(&session("desk1")).await.unwrap();
        store.put(&session("desk2")).await.unwrap();

        let reopened = FileSessionStore::open(dir.path()).await.unwrap();
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["desk1"], session("desk1"));
    }

    #[tokio::test]
    async fn put_overwrites_only_its_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();

        store.put(&session("desk1")).await.unwrap();
        store.put(&session("desk2")).await.unwrap();

        let mut changed = session("desk1");
        changed.controller_name = "Laptop".into();
        store.put(&changed).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded["desk1"].controller_name, "Laptop");
        assert_eq!(loaded["desk2"].controller_name, "Workstation");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn put_given_up_on_never_lands() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();

        let mut stale = session("desk1");
        stale.controller_name = "Stale".into();
        let held = store.commit.lock().unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), store.put(&stale)).await;
        assert!(timed_out.is_err());
        drop(held);

        let mut fresh = session("desk1");
        fresh.controller_name = "Fresh".into();
        store.put(&fresh).await.unwrap();

        // The stale blocking write cleans up after itself once it sees it
        // was abandoned.
        for _ in 0..200 {
            if temp_files(dir.path()).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(temp_files(dir.path()).is_empty());
        assert_eq!(store.load_all().await.unwrap()["desk1"].controller_name, "Fresh");
    }

    #[tokio::test]
    async fn open_clears_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(sessions.join("desk1.json.7.tmp"), "{}").unwrap();

        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(temp_files(dir.path()).is_empty());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        store.put(&session("desk1")).await.unwrap();
        std::fs::write(dir.path().join("sessions").join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("sessions").join("notes.txt"), "ignored").unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("desk1"));
    }

    #[tokio::test]
    async fn path_like_ids_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();

        let err = store.put(&session("../escape")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
