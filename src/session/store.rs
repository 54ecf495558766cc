//! Persistent session store backed by per-agent JSON snapshots.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::persistence::atomic_write;
use crate::session::model::{Session, SessionState};

const SESSION_FILE: &str = "session.json";

/// Thin I/O layer for session records. No in-memory cache.
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return `root/<uuid-hex>/` for the given session.
    pub fn agent_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join(session_id.simple().to_string())
    }

    /// Serialize and atomically write `session.json`.
    pub async fn save(&self, session: &Session) -> SubstratResult<()> {
        let data = serde_json::to_vec_pretty(session)?;
        let path = self.agent_dir(session.id).join(SESSION_FILE);
        atomic_write(&path, &data).await
    }

    /// Load one session record.
    pub async fn load(&self, session_id: Uuid) -> SubstratResult<Session> {
        let path = self.agent_dir(session_id).join(SESSION_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SubstratError::NotFound(format!(
                    "session {}",
                    session_id.simple()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load all session records under root, in directory order.
    pub async fn scan(&self) -> SubstratResult<Vec<Session>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut sessions = Vec::new();
        for dir in dirs {
            match tokio::fs::read(dir.join(SESSION_FILE)).await {
                Ok(data) => sessions.push(serde_json::from_slice(&data)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sessions)
    }

    /// Startup recovery: sweep stray `.tmp` files, flip ACTIVE -> SUSPENDED
    /// (the daemon was not running, so no provider is alive), re-save.
    pub async fn recover(&self) -> SubstratResult<Vec<Session>> {
        self.sweep_tmp().await?;
        let mut sessions = self.scan().await?;
        for session in &mut sessions {
            if session.state == SessionState::Active {
                session.transition(SessionState::Suspended)?;
                self.save(session).await?;
            }
        }
        Ok(sessions)
    }

    /// Delete a `.tmp` file found in any agent directory without inspection.
    async fn sweep_tmp(&self) -> SubstratResult<()> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(entry.path()).await?;
            while let Some(file) = inner.next_entry().await? {
                if file.file_name().to_string_lossy().ends_with(".tmp") {
                    tokio::fs::remove_file(file.path()).await?;
                }
            }
        }
        Ok(())
    }
}
