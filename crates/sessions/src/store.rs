//! Session persistence and the live session map.
//!
//! One JSON file per session under the storage directory. Writes are atomic:
//! serialize to `<id>.json.tmp`, fsync, rename. Startup sweeps any orphaned
//! `.tmp` files left by a crash mid-write. Filenames are session ids and are
//! validated before they ever touch a path.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use bc_domain::error::{Error, Result};
use bc_domain::message::PermissionRequest;
use bc_domain::state::SessionState;
use bc_protocol::SequencedEvent;

use crate::session::{Session, SessionLimits};
use crate::session_id;

pub const SCHEMA_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The on-disk form of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub adapter: String,
    pub state: SessionState,
    #[serde(default)]
    pub message_history: Vec<SequencedEvent>,
    #[serde(default)]
    pub pending_messages: Vec<String>,
    #[serde(default)]
    pub pending_permissions: Vec<(String, PermissionRequest)>,
    #[serde(default)]
    pub archived: bool,
    pub schema_version: u32,
}

impl SessionSnapshot {
    pub fn of(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            adapter: session.adapter_name(),
            state: session.state(),
            message_history: session.history_snapshot(),
            pending_messages: session.pending_messages_snapshot(),
            pending_permissions: session.permissions_snapshot(),
            archived: session.is_archived(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait SessionStorage: Send + Sync {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<SessionSnapshot>>;
    fn load_all(&self) -> Result<Vec<SessionSnapshot>>;
    fn remove(&self, id: &str) -> Result<()>;
}

pub struct FileSessionStorage {
    dir: PathBuf,
}

impl FileSessionStorage {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let storage = Self { dir };
        storage.sweep_orphans();
        Ok(storage)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !session_id::is_valid(id) {
            return Err(Error::InvalidPath(id.to_string()));
        }
        let path = self.dir.join(format!("{id}.json"));
        // The id is already shape-checked; this guards against future edits
        // loosening that.
        if !path.starts_with(&self.dir) {
            return Err(Error::InvalidPath(id.to_string()));
        }
        Ok(path)
    }

    fn sweep_orphans(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                tracing::warn!(path = %path.display(), "removing orphaned tmp file");
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

impl SessionStorage for FileSessionStorage {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.id)?;
        let json = serde_json::to_vec_pretty(snapshot)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        bc_domain::trace::TraceEvent::PersistenceFlush {
            session_id: snapshot.id.clone(),
            bytes: json.len(),
        }
        .emit();
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn load_all(&self) -> Result<Vec<SessionSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !session_id::is_valid(stem) {
                tracing::warn!(path = %path.display(), "skipping file with non-session-id name");
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(Error::from))
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                }
            }
        }
        Ok(snapshots)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The live session map plus its persistence adapter.
///
/// `save` is debounced per session (rapid state changes coalesce into one
/// write); `save_sync` bypasses the debounce for lifecycle transitions.
/// Persistence failures are logged, never fatal: in-memory state is
/// authoritative.
pub struct SessionRepository {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    storage: Arc<dyn SessionStorage>,
    debounce: Duration,
    pending_saves: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SessionRepository {
    pub fn new(storage: Arc<dyn SessionStorage>, debounce: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage,
            debounce,
            pending_saves: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Get or create under one write lock, so concurrent calls for the same
    /// id can never produce two sessions.
    pub fn get_or_create(
        &self,
        id: &str,
        make: impl FnOnce() -> Session,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(make());
        sessions.insert(id.to_string(), session.clone());
        (session, true)
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .insert(session.id().to_string(), session);
    }

    /// Drop the session from the map and delete its persisted file.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(handle) = self.pending_saves.lock().remove(id) {
            handle.abort();
        }
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            if let Err(e) = self.storage.remove(id) {
                tracing::warn!(session_id = %id, error = %e, "failed to remove persisted session");
            }
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Debounced save. Repeat calls within the window coalesce.
    pub fn save(&self, session: &Arc<Session>) {
        let id = session.id().to_string();
        let mut pending = self.pending_saves.lock();
        if pending.contains_key(&id) {
            return;
        }
        let storage = self.storage.clone();
        let session = session.clone();
        let pending_saves = self.pending_saves.clone();
        let debounce = self.debounce;
        let key = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let snapshot = SessionSnapshot::of(&session);
            if let Err(e) = storage.save(&snapshot) {
                tracing::warn!(session_id = %snapshot.id, error = %e, "debounced save failed");
            }
            pending_saves.lock().remove(&key);
        });
        pending.insert(id, handle);
    }

    /// Immediate save for critical transitions; cancels any pending
    /// debounced write.
    pub fn save_sync(&self, session: &Arc<Session>) {
        if let Some(handle) = self.pending_saves.lock().remove(session.id()) {
            handle.abort();
        }
        let snapshot = SessionSnapshot::of(session);
        if let Err(e) = self.storage.save(&snapshot) {
            tracing::warn!(session_id = %snapshot.id, error = %e, "save failed");
        }
    }

    /// Restore persisted sessions on startup. Sessions already live in the
    /// map are not overwritten. Returns how many were restored.
    pub fn restore_all(&self, limits: &SessionLimits) -> usize {
        let snapshots = match self.storage.load_all() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate persisted sessions");
                return 0;
            }
        };

        let mut restored = 0;
        for snapshot in snapshots {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&snapshot.id) {
                continue;
            }
            let session = Arc::new(restore_session(snapshot, limits.clone()));
            sessions.insert(session.id().to_string(), session);
            restored += 1;
        }

        bc_domain::trace::TraceEvent::SessionRestored { count: restored }.emit();
        restored
    }
}

fn restore_session(snapshot: SessionSnapshot, limits: SessionLimits) -> Session {
    let session = Session::new(snapshot.id, snapshot.adapter, limits);
    session.restore_history(snapshot.message_history);
    session.restore_pending_messages(snapshot.pending_messages);
    session.restore_permissions(snapshot.pending_permissions);
    session.set_archived(snapshot.archived);

    // Persisted slash commands and skills bring the registry back before the
    // backend re-attaches.
    session.with_registry(|registry| {
        registry.register_cli_commands(snapshot.state.slash_commands.iter().map(|name| {
            bc_domain::state::CommandInfo {
                name: name.clone(),
                description: None,
                argument_hint: None,
            }
        }));
        registry.register_skills(&snapshot.state.skills);
    });

    session.set_state(snapshot.state);
    session
}
