//! Session history storage.
//!
//! Sessions only grow: [`ContextStore::append_turn`] is the one mutation and
//! nothing deletes a session. An unknown session reads as empty history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::persistence::{atomic_write_json, list_json_files, load_json, store_error};
use crate::types::{Session, SessionSummary, Turn};

/// Acknowledgement of an appended turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Turns stored for the session after the append.
    pub turn_count: usize,
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Prior turns in order, oldest first. Unknown or blank ids read as
    /// empty history.
    async fn get_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError>;

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<Ack, StoreError>;

    /// Known sessions, most recently updated first.
    async fn sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;
}

fn require_id(session_id: &str) -> Result<(), StoreError> {
    if session_id.trim().is_empty() {
        return Err(StoreError::EmptySessionId);
    }
    Ok(())
}

fn retain_recent(session: &mut Session, max_turns: usize) {
    if max_turns > 0 && session.turns.len() > max_turns {
        let excess = session.turns.len() - max_turns;
        session.turns.drain(..excess);
    }
}

fn sort_recent_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
}

/// Process-local store, mainly for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryContextStore {
    sessions: Mutex<HashMap<String, Session>>,
    max_turns: usize,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_turns,
        }
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        if session_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default())
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<Ack, StoreError> {
        require_id(session_id)?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.turns.push(turn);
        session.updated_at = Utc::now();
        retain_recent(session, self.max_turns);
        Ok(Ack {
            turn_count: session.turns.len(),
        })
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<_> = self
            .sessions
            .lock()
            .await
            .values()
            .map(Session::summary)
            .collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

/// One JSON file per session under a directory.
///
/// File names are the URL-encoded session id, so arbitrary ids cannot
/// escape the directory. Appends hold a lock for the read-modify-write
/// and replace the file atomically.
pub struct FileContextStore {
    dir: PathBuf,
    max_turns: usize,
    write_lock: Mutex<()>,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>, max_turns: usize) -> Self {
        Self {
            dir: dir.into(),
            max_turns,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", urlencoding::encode(session_id)))
    }

    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(session_id);
        load_json(&path).map_err(|e| store_error(&path, e))
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn get_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        if session_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .load(session_id)?
            .map(|s| s.turns)
            .unwrap_or_default())
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<Ack, StoreError> {
        require_id(session_id)?;
        let _guard = self.write_lock.lock().await;

        let mut session = self
            .load(session_id)?
            .unwrap_or_else(|| Session::new(session_id));
        session.turns.push(turn);
        session.updated_at = Utc::now();
        retain_recent(&mut session, self.max_turns);

        let path = self.session_path(session_id);
        atomic_write_json(&path, &session).map_err(|e| store_error(&path, e))?;
        debug!(session_id, turns = session.turns.len(), "Appended turn");
        Ok(Ack {
            turn_count: session.turns.len(),
        })
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let files = list_json_files(&self.dir).map_err(|e| store_error(&self.dir, e))?;
        let mut summaries = Vec::with_capacity(files.len());
        for path in files {
            match load_json::<Session>(&path) {
                Ok(Some(session)) => summaries.push(session.summary()),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}
