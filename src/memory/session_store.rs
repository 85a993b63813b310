//! Per-session memory snapshots.
//!
//! Each session is saved to `{sessions_dir}/{session_id}.json` after every
//! completed turn and restored when the same session id is resumed.

use super::summary_buffer::{ConversationMemory, MemorySnapshot};
use crate::{ChatmemError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Snapshot saved per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub memory: MemorySnapshot,
}

/// Manages per-session state files.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Create a new session store. Creates the directory if needed.
    pub async fn new(sessions_dir: &Path) -> Result<Self> {
        fs::create_dir_all(sessions_dir).await?;
        Ok(Self {
            sessions_dir: sessions_dir.to_path_buf(),
        })
    }

    /// Save the current memory state for a session.
    pub async fn save(&self, session_id: &str, memory: &ConversationMemory) -> Result<()> {
        let snapshot = SessionSnapshot {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            memory: memory.snapshot(),
        };

        let path = self.session_path(session_id)?;
        let content = serde_json::to_string_pretty(&snapshot)?;

        // write then rename so a crash never leaves a half-written session
        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        debug!(
            "Saved session {} ({} turns)",
            session_id,
            snapshot.memory.turns.len()
        );
        Ok(())
    }

    /// Load a previously saved snapshot.
    /// Returns None if no session exists or the file cannot be parsed.
    pub async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.session_path(session_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<SessionSnapshot>(&content) {
            Ok(snapshot) => {
                info!(
                    "Loaded session {} ({} turns)",
                    session_id,
                    snapshot.memory.turns.len()
                );
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Failed to parse session file for {}: {}", session_id, e);
                Ok(None)
            }
        }
    }

    /// Load a session into `memory` if one exists. Returns whether it did.
    pub async fn restore_into(
        &self,
        session_id: &str,
        memory: &mut ConversationMemory,
    ) -> Result<bool> {
        match self.load(session_id).await? {
            Some(snapshot) => {
                memory.restore(snapshot.memory);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// List all saved session ids, sorted.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(session_id) = name.strip_suffix(".json") {
                    sessions.push(session_id.to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Remove old sessions, keeping the `keep` most recently modified.
    pub async fn cleanup(&self, keep: usize) -> Result<usize> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        let mut dir = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    entries.push((path, modified));
                }
            }
        }

        // oldest first
        entries.sort_by_key(|(_, t)| *t);

        if entries.len() <= keep {
            return Ok(0);
        }
        let to_remove = entries.len() - keep;
        let mut removed = 0;
        for (path, _) in entries.iter().take(to_remove) {
            match fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        info!("Cleaned up {} old session files", removed);
        Ok(removed)
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.trim().is_empty() {
            return Err(ChatmemError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }
        let safe_id: String = session_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Ok(self.sessions_dir.join(format!("{}.json", safe_id)))
    }
}
