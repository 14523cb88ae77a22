use async_trait::async_trait;
use nanoid::nanoid;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::agent::SessionState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid run id: {0}")]
    InvalidId(String),
    #[error("session store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization: {0}")]
    Serialization(String),
}

/// Keeps suspended runs between processes, keyed by run id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, state: &SessionState) -> Result<(), StoreError>;
    async fn load(&self, run_id: &str) -> Result<Option<SessionState>, StoreError>;
    async fn delete(&self, run_id: &str) -> Result<(), StoreError>;
    /// Ids of every stored run, sorted.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

// ========================= In-memory =========================

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SessionState>, StoreError> {
        Ok(self.sessions.read().await.get(run_id).cloned())
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ========================= On disk =========================

/// One pretty-printed JSON file per run under `base_path`.
pub struct FileSessionStore {
    base_path: PathBuf,
}

impl FileSessionStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn session_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        validate_run_id(run_id)?;
        Ok(self.base_path.join(format!("{run_id}.json")))
    }
}

/// Run ids become file names: no separators, `..`, or control characters.
fn validate_run_id(run_id: &str) -> Result<(), StoreError> {
    if run_id.is_empty() {
        return Err(StoreError::InvalidId("run id cannot be empty".into()));
    }
    if run_id.contains('/') || run_id.contains('\\') || run_id.contains("..") {
        return Err(StoreError::InvalidId(format!(
            "run id contains invalid characters: {run_id:?}"
        )));
    }
    if run_id.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidId(format!(
            "run id contains control characters: {run_id:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        let path = self.session_path(&state.run_id)?;
        tokio::fs::create_dir_all(&self.base_path).await?;
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // write-then-rename so a crash never leaves half a session behind
        let tmp_path = self
            .base_path
            .join(format!(".{}.{}.tmp", state.run_id, nanoid!(8)));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        debug!(run_id = %state.run_id, path = %path.display(), "session saved");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SessionState>, StoreError> {
        let path = self.session_path(run_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_str(&content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(state))
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        let path = self.session_path(run_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                    if !id.starts_with('.') {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
