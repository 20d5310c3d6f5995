//! Local store - user id, session list, conversations
//!
//! A directory holding three independently loadable files:
//! - user_id: plain text
//! - sessions.json: ordered session ids, newest first
//! - conversations.json: session id -> [{sender, text}]
//!
//! Loading never fails: missing or malformed files fall back to defaults.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::message::{self, Conversation, Message, SessionId, StoredMessage};

const USER_ID_FILE: &str = "user_id";
const SESSIONS_FILE: &str = "sessions.json";
const CONVERSATIONS_FILE: &str = "conversations.json";

/// Everything the store knows, after repair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub user_id: Option<String>,
    pub sessions: Vec<SessionId>,
    pub conversations: HashMap<SessionId, Conversation>,
    /// Load dropped duplicates or orphans, or filled in missing conversations
    pub repaired: bool,
}

/// File-backed key-value store
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    /// Open (and create) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load persisted state, repairing the session/conversation pairing
    pub fn load(&self) -> LocalState {
        let user_id = fs::read_to_string(self.dir.join(USER_ID_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let raw_sessions: Vec<SessionId> = self.read_json(SESSIONS_FILE);
        let mut stored: HashMap<SessionId, Vec<StoredMessage>> = self.read_json(CONVERSATIONS_FILE);

        let raw_len = raw_sessions.len();
        let mut seen = HashSet::new();
        let sessions: Vec<SessionId> = raw_sessions
            .into_iter()
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        let mut repaired = sessions.len() != raw_len;

        let conversations = sessions
            .iter()
            .map(|id| {
                let conv = stored
                    .remove(id)
                    .unwrap_or_else(|| {
                        repaired = true;
                        Vec::new()
                    })
                    .into_iter()
                    .map(Message::from)
                    .collect();
                (id.clone(), conv)
            })
            .collect();

        if !stored.is_empty() {
            tracing::debug!(orphans = stored.len(), "dropping conversations without a session");
            repaired = true;
        }

        LocalState {
            user_id,
            sessions,
            conversations,
            repaired,
        }
    }

    pub fn save_user_id(&self, user_id: &str) -> Result<()> {
        self.write_atomic(USER_ID_FILE, user_id)
    }

    pub fn save_sessions(&self, sessions: &[SessionId]) -> Result<()> {
        let content = serde_json::to_string(sessions)?;
        self.write_atomic(SESSIONS_FILE, &content)
    }

    /// Persist conversations; placeholders never reach disk
    pub fn save_conversations(&self, conversations: &HashMap<SessionId, Conversation>) -> Result<()> {
        let snapshot: BTreeMap<&str, Vec<StoredMessage>> = conversations
            .iter()
            .map(|(id, conv)| (id.as_str(), message::to_stored(conv)))
            .collect();
        let content = serde_json::to_string(&snapshot)?;
        self.write_atomic(CONVERSATIONS_FILE, &content)
    }

    fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.dir.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return T::default(),
        };

        match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed store file, using defaults");
                T::default()
            }
        }
    }

    /// Temp file + rename so a crash never leaves a torn snapshot
    fn write_atomic(&self, name: &str, content: &str) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!(".{}.tmp", name));

        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
