//! Durable processing snapshot.
//!
//! The snapshot is the single source of truth for "has this item already
//! become a note". It is loaded once at startup and saved after every
//! processed item, at the end of every cycle, and on shutdown.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::fs::atomic_write;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What has been processed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    /// Library version marker as of the last successful poll.
    pub last_version: u64,
    /// Keys that have produced a note or were registered as duplicates.
    /// Only ever grows.
    pub processed_keys: BTreeSet<String>,
    /// Normalized titles of processed items.
    pub processed_titles: BTreeSet<String>,
    /// Keys classified as new that have not completed yet. Polled again each
    /// cycle even though `last_version` has moved past them.
    #[serde(default)]
    pub retry_keys: BTreeSet<String>,
}

impl ProcessingState {
    pub fn is_processed(&self, key: &str) -> bool {
        self.processed_keys.contains(key)
    }

    /// True when a non-empty normalized title has already been seen.
    pub fn has_title(&self, normalized: &str) -> bool {
        !normalized.is_empty() && self.processed_titles.contains(normalized)
    }

    /// Record a finished item and drop it from the retry queue.
    pub fn mark_processed(&mut self, key: &str, normalized_title: &str) {
        self.processed_keys.insert(key.to_string());
        if !normalized_title.is_empty() {
            self.processed_titles.insert(normalized_title.to_string());
        }
        self.retry_keys.remove(key);
    }

    /// Record a key that duplicates an already processed title.
    pub fn mark_duplicate(&mut self, key: &str) {
        self.processed_keys.insert(key.to_string());
        self.retry_keys.remove(key);
    }

    pub fn enqueue_retry(&mut self, key: &str) {
        if !self.is_processed(key) {
            self.retry_keys.insert(key.to_string());
        }
    }
}

/// Loads and saves `ProcessingState` as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. Missing or unreadable files yield the zero state.
    pub async fn load(&self) -> ProcessingState {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProcessingState::default();
            }
            Err(e) => {
                warn!("Failed to read state file {:?}: {}; starting fresh", self.path, e);
                return ProcessingState::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Malformed state file {:?}: {}; starting fresh", self.path, e);
                ProcessingState::default()
            }
        }
    }

    pub async fn save(&self, state: &ProcessingState) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path, json.as_bytes())
            .await
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
