//! Session persistence.
//!
//! Stores are keyed by session id and only ever mutate one session per call,
//! through [`InvocationSession::apply`]. Two backends are provided: an
//! in-process map and a directory of JSON files (one per session) which lets
//! a later `agentprobe latency` run pick up a session recorded by `invoke`.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};

use crate::error::ProbeError;
use crate::types::{InvocationSession, SessionUpdate};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new session. Fails if the id is already taken.
    async fn create(&self, session: InvocationSession) -> Result<(), ProbeError>;

    async fn get(&self, session_id: &str) -> Result<Option<InvocationSession>, ProbeError>;

    /// Applies one update and returns the session as it is afterwards.
    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<InvocationSession, ProbeError>;

    /// Removes a session, returning whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool, ProbeError>;

    /// All sessions, oldest first.
    async fn list(&self) -> Result<Vec<InvocationSession>, ProbeError>;
}

/// In-process store. Each session sits behind its own lock so writers of
/// different sessions never wait on each other.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<InvocationSession>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, session_id: &str) -> Option<Arc<Mutex<InvocationSession>>> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: InvocationSession) -> Result<(), ProbeError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(ProbeError::Store(format!(
                "session '{}' already exists",
                session.session_id
            )));
        }
        sessions.insert(session.session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<InvocationSession>, ProbeError> {
        match self.entry(session_id).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<InvocationSession, ProbeError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or_else(|| ProbeError::SessionNotFound(session_id.to_string()))?;
        let mut session = entry.lock().await;
        if !session.apply(update) {
            tracing::trace!(session_id, "Session update was a no-op.");
        }
        Ok(session.clone())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, ProbeError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<InvocationSession>, ProbeError> {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            sessions.push(entry.lock().await.clone());
        }
        sessions.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(sessions)
    }
}

/// Directory-backed store, one `<session_id>.json` file per session.
///
/// Several processes may share a directory (an `invoke` still streaming while
/// `latency` runs elsewhere), so every read-modify-write holds an exclusive
/// advisory lock on `<dir>/.lock` and each write goes through its own
/// temporary file before being renamed into place.
pub struct JsonSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSessionStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ProbeError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "Opened JSON session store.");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, ProbeError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    /// Runs `f` with the directory lock held. The in-process mutex keeps
    /// writers of this store from piling up on blocking threads.
    async fn locked<T, F>(&self, f: F) -> Result<T, ProbeError>
    where
        F: FnOnce(&Path) -> Result<T, ProbeError> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = DirLock::acquire(&dir)?;
            f(&dir)
        })
        .await
        .map_err(|e| ProbeError::Store(format!("store task failed: {}", e)))?
    }
}

/// Exclusive advisory lock on the store directory, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, ProbeError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // the lock file itself stays; removing it would let a waiter hold a
        // lock on an unlinked inode
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_session(path: &Path) -> Result<Option<InvocationSession>, ProbeError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_session(dir: &Path, path: &Path, session: &InvocationSession) -> Result<(), ProbeError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), session)?;
    tmp.as_file_mut().write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn create(&self, session: InvocationSession) -> Result<(), ProbeError> {
        let path = self.path_for(&session.session_id)?;
        self.locked(move |dir| {
            if path.try_exists()? {
                return Err(ProbeError::Store(format!(
                    "session '{}' already exists",
                    session.session_id
                )));
            }
            write_session(dir, &path, &session)
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<Option<InvocationSession>, ProbeError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<InvocationSession, ProbeError> {
        let path = self.path_for(session_id)?;
        let session_id = session_id.to_string();
        self.locked(move |dir| {
            let mut session = read_session(&path)?
                .ok_or_else(|| ProbeError::SessionNotFound(session_id.clone()))?;
            if session.apply(update) {
                write_session(dir, &path, &session)?;
            } else {
                tracing::trace!(session_id = %session_id, "Session update was a no-op.");
            }
            Ok(session)
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<bool, ProbeError> {
        let path = self.path_for(session_id)?;
        self.locked(move |_| match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn list(&self) -> Result<Vec<InvocationSession>, ProbeError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.get(session_id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file.");
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(sessions)
    }
}

/// Session ids become file names, so only `[A-Za-z0-9_-]` is accepted.
fn validate_session_id(session_id: &str) -> Result<(), ProbeError> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProbeError::SessionNotFound(session_id.to_string()))
    }
}
