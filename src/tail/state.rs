use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupt fetch state for source '{source_id}': {reason}")]
    Corrupt { source_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// What is known about one remote file from the previous cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// First line of the file when last observed; empty when unknown
    pub fingerprint: String,
    /// Bytes consumed from the start of the file
    pub offset: u64,
}

/// Persisted state of one source, keyed by file basename
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    /// Highest entry timestamp stored so far; entries at or below it are dropped
    #[serde(default)]
    pub last_entry_timestamp: Option<String>,
    #[serde(default)]
    pub last_fetch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_entries_fetched: u64,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            files: BTreeMap::new(),
            last_entry_timestamp: None,
            last_fetch_time: None,
            total_entries_fetched: 0,
        }
    }
}

impl SourceState {
    pub fn file(&self, key: &str) -> Option<&FileState> {
        self.files.get(key)
    }

    /// Raise the watermark; it never moves backwards
    pub fn advance_watermark(&mut self, timestamp: &str) {
        match &self.last_entry_timestamp {
            Some(current) if current.as_str() >= timestamp => {}
            _ => self.last_entry_timestamp = Some(timestamp.to_string()),
        }
    }
}

/// Loads and saves [`SourceState`] through the storage metadata table
pub struct StateStore {
    storage: Arc<dyn Storage>,
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn key(source_id: &str) -> String {
        format!("fetch_state:{}", source_id)
    }

    /// Load the state of a source, or a fresh state when none is stored or the
    /// stored blob was written by another state version
    pub async fn load(&self, source_id: &str) -> Result<SourceState> {
        let Some(blob) = self.storage.get_metadata(&Self::key(source_id)).await? else {
            tracing::debug!(source_id = %source_id, "No fetch state stored, starting fresh");
            return Ok(SourceState::default());
        };

        let corrupt = |reason: String| StateError::Corrupt {
            source_id: source_id.to_string(),
            reason,
        };

        let value: serde_json::Value =
            serde_json::from_str(&blob).map_err(|e| corrupt(e.to_string()))?;
        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(CURRENT_VERSION as u64) {
            tracing::warn!(
                source_id = %source_id,
                "Fetch state version mismatch: {:?} vs {}, ignoring stored state",
                version,
                CURRENT_VERSION
            );
            return Ok(SourceState::default());
        }

        let state: SourceState = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        tracing::debug!(
            source_id = %source_id,
            files = state.files.len(),
            watermark = ?state.last_entry_timestamp,
            "Loaded fetch state"
        );
        Ok(state)
    }

    pub async fn save(&self, source_id: &str, state: &SourceState) -> Result<()> {
        let blob = serde_json::to_string(state).map_err(StorageError::from)?;
        self.storage.set_metadata(&Self::key(source_id), &blob).await?;
        tracing::debug!(source_id = %source_id, "Fetch state saved");
        Ok(())
    }
}
