//! Key-to-path index over the notes folder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use literature_notes::Note;
use tokio::fs;
use tracing::{debug, warn};

use crate::fs::list_notes;

/// Maps library item keys to the note files that reference them.
///
/// Built by reading the `zotero_key` header of every note in the notes
/// directory. Lookups that miss trigger at most one rebuild per cycle, so a
/// note created or renamed by hand is found without rescanning the folder for
/// every key.
#[derive(Debug)]
pub struct NoteIndex {
    notes_dir: PathBuf,
    /// Map from item key to note path
    by_key: HashMap<String, PathBuf>,
    /// Whether a miss already forced a rebuild during the current cycle
    rebuilt_on_miss: bool,
}

impl NoteIndex {
    pub fn new(notes_dir: impl Into<PathBuf>) -> Self {
        Self {
            notes_dir: notes_dir.into(),
            by_key: HashMap::new(),
            rebuilt_on_miss: false,
        }
    }

    pub fn notes_dir(&self) -> &Path {
        &self.notes_dir
    }

    /// Rescan the notes directory.
    pub async fn rebuild(&mut self) -> Result<(), std::io::Error> {
        let mut by_key: HashMap<String, PathBuf> = HashMap::new();
        for path in list_notes(&self.notes_dir).await? {
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    continue;
                }
            };
            let note = Note::parse(&content);
            if let Some(key) = note.zotero_key() {
                if let Some(existing) = by_key.get(key) {
                    warn!(
                        "Item {} is referenced by both {} and {}; using the first",
                        key,
                        existing.display(),
                        path.display()
                    );
                    continue;
                }
                by_key.insert(key.to_string(), path);
            }
        }
        debug!("Indexed {} note(s) by item key", by_key.len());
        self.by_key = by_key;
        Ok(())
    }

    /// Start a new polling cycle: rebuild once and re-arm the miss rebuild.
    pub async fn begin_cycle(&mut self) -> Result<(), std::io::Error> {
        self.rebuild().await?;
        self.rebuilt_on_miss = false;
        Ok(())
    }

    /// Find the note for `key`, rebuilding once per cycle on a miss or a stale path.
    pub async fn locate(&mut self, key: &str) -> Result<Option<PathBuf>, std::io::Error> {
        if let Some(path) = self.by_key.get(key) {
            if fs::try_exists(path).await? {
                return Ok(Some(path.clone()));
            }
        }
        if self.rebuilt_on_miss {
            return Ok(None);
        }
        self.rebuilt_on_miss = true;
        self.rebuild().await?;
        Ok(self.by_key.get(key).cloned())
    }

    /// Record a note this process just wrote.
    pub fn insert(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) {
        self.by_key.insert(key.into(), path.into());
    }

    pub fn get(&self, key: &str) -> Option<&Path> {
        self.by_key.get(key).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn note_with_key(key: &str) -> String {
        format!("---\ntitle: \"T\"\nzotero_key: {key}\n---\nbody\n")
    }

    #[tokio::test]
    async fn test_rebuild_indexes_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("@2020_A.md"), note_with_key("K1")).unwrap();
        std::fs::write(dir.path().join("@2021_B.md"), note_with_key("")).unwrap();
        std::fs::write(dir.path().join("other.md"), note_with_key("K9")).unwrap();

        let mut index = NoteIndex::new(dir.path());
        index.rebuild().await.unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("K1"), Some(dir.path().join("@2020_A.md").as_path()));
    }

    #[tokio::test]
    async fn test_locate_rebuilds_once_per_cycle() {
        let dir = TempDir::new().unwrap();
        let mut index = NoteIndex::new(dir.path());
        index.begin_cycle().await.unwrap();

        std::fs::write(dir.path().join("@2020_A.md"), note_with_key("K1")).unwrap();
        assert!(index.locate("K1").await.unwrap().is_some());

        // The miss rebuild is spent for this cycle.
        std::fs::write(dir.path().join("@2020_B.md"), note_with_key("K2")).unwrap();
        assert!(index.locate("K2").await.unwrap().is_none());

        index.begin_cycle().await.unwrap();
        assert!(index.locate("K2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_locate_follows_renamed_note() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("@2020_Old.md");
        std::fs::write(&old, note_with_key("K1")).unwrap();

        let mut index = NoteIndex::new(dir.path());
        index.begin_cycle().await.unwrap();

        let renamed = dir.path().join("@2020_New.md");
        std::fs::rename(&old, &renamed).unwrap();
        assert_eq!(index.locate("K1").await.unwrap(), Some(renamed));
    }
}
