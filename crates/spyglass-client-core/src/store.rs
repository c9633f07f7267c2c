use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::SessionState;

const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store_io_failed:{0}")]
    Io(#[from] std::io::Error),
    #[error("store_encode_failed:{0}")]
    Encode(#[from] serde_json::Error),
    #[error("store_lock_poisoned")]
    Poisoned,
}

/// Persisted credential/state store.
///
/// One store handle is shared process-wide; clearing the session is the
/// logout lifecycle hook and is observed by every holder immediately.
/// Advisory markers (cooldown timestamps) live in the same store but are
/// deliberately untouched by `clear_session`.
pub trait CredentialStore: Send + Sync {
    fn load_session(&self) -> Result<Option<SessionState>, StoreError>;
    fn persist_session(&self, state: &SessionState) -> Result<(), StoreError>;
    fn clear_session(&self) -> Result<(), StoreError>;

    fn read_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn write_marker(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn clear_marker(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and embedded single-process use.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    session: RwLock<Option<SessionState>>,
    markers: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(state: SessionState) -> Self {
        Self {
            session: RwLock::new(Some(state)),
            markers: RwLock::new(BTreeMap::new()),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_session(&self) -> Result<Option<SessionState>, StoreError> {
        Ok(self
            .session
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .clone())
    }

    fn persist_session(&self, state: &SessionState) -> Result<(), StoreError> {
        *self.session.write().map_err(|_| StoreError::Poisoned)? = Some(state.clone());
        Ok(())
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        *self.session.write().map_err(|_| StoreError::Poisoned)? = None;
        Ok(())
    }

    fn read_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .markers
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(key)
            .copied())
    }

    fn write_marker(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.markers
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(key.to_string(), at);
        Ok(())
    }

    fn clear_marker(&self, key: &str) -> Result<(), StoreError> {
        self.markers
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<SessionState>,
    #[serde(default)]
    markers: BTreeMap<String, String>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_SCHEMA_VERSION,
            session: None,
            markers: BTreeMap::new(),
        }
    }
}

/// File-backed store: one versioned JSON document per profile.
///
/// Loads are tolerant of a missing or corrupt file (fresh state); every
/// mutation flushes the whole document.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    document: RwLock<StoreDocument>,
}

impl FileCredentialStore {
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let document = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreDocument>(raw.as_str()) {
                Ok(document) if document.version == STORE_SCHEMA_VERSION => document,
                Ok(_) | Err(_) => StoreDocument::default(),
            },
            Err(_) => StoreDocument::default(),
        };
        Self {
            path,
            document: RwLock::new(document),
        }
    }

    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn flush(&self, document: &StoreDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(document)?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_session(&self) -> Result<Option<SessionState>, StoreError> {
        Ok(self
            .document
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .session
            .clone())
    }

    fn persist_session(&self, state: &SessionState) -> Result<(), StoreError> {
        let mut document = self.document.write().map_err(|_| StoreError::Poisoned)?;
        document.session = Some(state.clone());
        self.flush(&document)
    }

    fn clear_session(&self) -> Result<(), StoreError> {
        let mut document = self.document.write().map_err(|_| StoreError::Poisoned)?;
        document.session = None;
        self.flush(&document)
    }

    fn read_marker(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let document = self.document.read().map_err(|_| StoreError::Poisoned)?;
        Ok(document
            .markers
            .get(key)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc)))
    }

    fn write_marker(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut document = self.document.write().map_err(|_| StoreError::Poisoned)?;
        document.markers.insert(key.to_string(), at.to_rfc3339());
        self.flush(&document)
    }

    fn clear_marker(&self, key: &str) -> Result<(), StoreError> {
        let mut document = self.document.write().map_err(|_| StoreError::Poisoned)?;
        document.markers.remove(key);
        self.flush(&document)
    }
}
