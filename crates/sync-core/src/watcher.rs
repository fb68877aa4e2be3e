//! Note change detection by modification time and content hash.
//!
//! The watcher keeps a snapshot of every literature note and reports files
//! whose modification time and content hash both changed since the previous
//! scan. Writes made by this process are registered with
//! `mark_self_modified` and are not reported back during a cooldown window,
//! so a merge into a note is never mistaken for a human edit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use literature_notes::{ContentHash, Note};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::fs::list_notes;
use crate::library::{Library, LibraryError};
use crate::reconcile::push_diff;

/// How long a self-written file is ignored by `scan`.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to read note {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Library(#[from] LibraryError),
}

impl PushError {
    /// The item changed remotely after it was fetched.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PushError::Library(LibraryError::VersionConflict { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    mtime: SystemTime,
    hash: ContentHash,
}

/// Paths written by this process, with the time of the write.
#[derive(Debug)]
struct SelfWriteTracker {
    marks: HashMap<PathBuf, Instant>,
    cooldown: Duration,
}

impl SelfWriteTracker {
    fn new(cooldown: Duration) -> Self {
        Self {
            marks: HashMap::new(),
            cooldown,
        }
    }

    fn mark(&mut self, path: &Path) {
        self.marks.insert(path.to_path_buf(), Instant::now());
    }

    /// Whether `path` is inside its cooldown window.
    fn is_suppressed(&self, path: &Path) -> bool {
        self.marks
            .get(path)
            .is_some_and(|marked| marked.elapsed() < self.cooldown)
    }

    /// Remove expired marks to prevent memory growth.
    fn prune(&mut self) {
        let cooldown = self.cooldown;
        self.marks.retain(|_, marked| marked.elapsed() < cooldown);
    }
}

pub struct NoteWatcher {
    notes_dir: PathBuf,
    snapshots: HashMap<PathBuf, Snapshot>,
    self_writes: SelfWriteTracker,
}

impl NoteWatcher {
    pub fn new(notes_dir: impl Into<PathBuf>) -> Self {
        Self::with_cooldown(notes_dir, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(notes_dir: impl Into<PathBuf>, cooldown: Duration) -> Self {
        Self {
            notes_dir: notes_dir.into(),
            snapshots: HashMap::new(),
            self_writes: SelfWriteTracker::new(cooldown),
        }
    }

    async fn snapshot(path: &Path) -> Result<Snapshot, std::io::Error> {
        let mtime = fs::metadata(path).await?.modified()?;
        let content = fs::read(path).await?;
        Ok(Snapshot {
            mtime,
            hash: ContentHash::from_content(&content),
        })
    }

    /// Files changed by someone else since the previous scan.
    ///
    /// The first time a file is seen it is only recorded. Deleted files are
    /// forgotten.
    pub async fn scan(&mut self) -> Result<Vec<PathBuf>, WatchError> {
        self.self_writes.prune();

        let paths = list_notes(&self.notes_dir).await?;
        self.snapshots.retain(|p, _| paths.contains(p));

        let mut changed = Vec::new();
        for path in paths {
            let mtime = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let previous = match self.snapshots.get(&path) {
                Some(previous) if previous.mtime == mtime => continue,
                Some(previous) => Some(previous.hash.clone()),
                None => None,
            };

            let content = match fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let hash = ContentHash::from_content(&content);
            let content_changed = previous.as_ref().is_some_and(|h| *h != hash);
            self.snapshots.insert(path.clone(), Snapshot { mtime, hash });

            if !content_changed {
                continue;
            }
            if self.self_writes.is_suppressed(&path) {
                debug!("Ignoring self-modified {}", path.display());
                continue;
            }
            changed.push(path);
        }

        if !changed.is_empty() {
            info!("Detected {} edited note(s)", changed.len());
        }
        Ok(changed)
    }

    /// Register a write made by this process and take its post-write snapshot.
    pub async fn mark_self_modified(&mut self, path: &Path) {
        self.self_writes.mark(path);
        match Self::snapshot(path).await {
            Ok(snapshot) => {
                self.snapshots.insert(path.to_path_buf(), snapshot);
            }
            Err(e) => debug!("Could not snapshot {}: {}", path.display(), e),
        }
    }

    pub fn tracked(&self) -> usize {
        self.snapshots.len()
    }

    /// Push a note's edited citation fields and tags back to its library item.
    ///
    /// Fetches the item, computes the field diff and sends one update gated on
    /// the fetched version. Returns `Ok(false)` when the note has no item key
    /// or nothing differs. A version conflict is returned as an error and is
    /// not retried.
    pub async fn push_to_library<L>(&self, library: &L, path: &Path) -> Result<bool, PushError>
    where
        L: Library + ?Sized,
    {
        let content = fs::read_to_string(path).await.map_err(|source| PushError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let note = Note::parse(&content);
        let Some(key) = note.zotero_key() else {
            debug!("{} has no item key; nothing to push", path.display());
            return Ok(false);
        };

        let item = library.item(key).await?;
        let update = push_diff(&note, &item.data);
        if update.is_empty() {
            debug!("{} matches item {}", path.display(), key);
            return Ok(false);
        }

        library.update_item(key, item.version, &update).await?;
        info!(
            "Pushed {} to item {}: {}",
            path.display(),
            key,
            update.field_names().join(", ")
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{CreateResult, FieldUpdate, InMemoryLibrary, Item, ItemData, Tag};
    use async_trait::async_trait;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_with_mtime(path: &Path, content: &str, offset_secs: u64) {
        std::fs::write(path, content).unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset_secs);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn note(key: &str, journal: &str) -> String {
        format!(
            "---\ntitle: \"T\"\ntags: [literature, paper, nlp]\nzotero_key: {key}\n---\n\n\
             ## Citation\n- **Author**: Someone Else\n- **Journal**: {journal}\n- **Volume**: \n\n\
             ## My Thoughts\n> [thoughts]\n"
        )
    }

    // ==================== scan tests ====================

    #[tokio::test]
    async fn test_first_scan_is_baseline() {
        let dir = TempDir::new().unwrap();
        write_with_mtime(&dir.path().join("@2020_A.md"), "a", 0);

        let mut watcher = NoteWatcher::new(dir.path());
        assert!(watcher.scan().await.unwrap().is_empty());
        assert_eq!(watcher.tracked(), 1);
    }

    #[tokio::test]
    async fn test_reports_mtime_and_content_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_A.md");
        write_with_mtime(&path, "a", 0);

        let mut watcher = NoteWatcher::new(dir.path());
        watcher.scan().await.unwrap();

        write_with_mtime(&path, "b", 10);
        assert_eq!(watcher.scan().await.unwrap(), vec![path.clone()]);
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_without_content_change_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_A.md");
        write_with_mtime(&path, "same", 0);

        let mut watcher = NoteWatcher::new(dir.path());
        watcher.scan().await.unwrap();

        write_with_mtime(&path, "same", 10);
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_change_with_same_mtime_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_A.md");
        write_with_mtime(&path, "a", 0);

        let mut watcher = NoteWatcher::new(dir.path());
        watcher.scan().await.unwrap();

        write_with_mtime(&path, "b", 0);
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_modified_suppressed_then_external_edit_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_A.md");
        write_with_mtime(&path, "original", 0);

        let mut watcher = NoteWatcher::with_cooldown(dir.path(), Duration::from_millis(200));
        watcher.scan().await.unwrap();

        // Merge writes the note and registers the write.
        write_with_mtime(&path, "merged", 10);
        watcher.mark_self_modified(&path).await;
        assert!(watcher.scan().await.unwrap().is_empty());

        // An edit inside the window is still treated as ours.
        write_with_mtime(&path, "merged again", 20);
        assert!(watcher.scan().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;

        write_with_mtime(&path, "human edit", 30);
        assert_eq!(watcher.scan().await.unwrap(), vec![path]);
    }

    #[tokio::test]
    async fn test_deleted_files_forgotten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_A.md");
        write_with_mtime(&path, "a", 0);

        let mut watcher = NoteWatcher::new(dir.path());
        watcher.scan().await.unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        assert_eq!(watcher.tracked(), 0);
    }

    // ==================== push tests ====================

    fn remote_item() -> ItemData {
        ItemData {
            key: "K1".into(),
            item_type: "journalArticle".into(),
            title: "T".into(),
            publication_title: "Old Journal".into(),
            tags: vec![Tag::new("nlp")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_push_sends_changed_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_T.md");
        std::fs::write(&path, note("K1", "New Journal")).unwrap();

        let lib = InMemoryLibrary::new();
        lib.insert(remote_item());

        let watcher = NoteWatcher::new(dir.path());
        assert!(watcher.push_to_library(&lib, &path).await.unwrap());

        let data = lib.get("K1").unwrap().data;
        assert_eq!(data.publication_title, "New Journal");
        // Author is never pushed.
        assert!(data.creators.is_empty());

        // Nothing left to push.
        assert!(!watcher.push_to_library(&lib, &path).await.unwrap());
    }

    #[tokio::test]
    async fn test_push_without_key_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_T.md");
        std::fs::write(&path, note("", "J")).unwrap();

        let lib = InMemoryLibrary::new();
        let watcher = NoteWatcher::new(dir.path());
        assert!(!watcher.push_to_library(&lib, &path).await.unwrap());
    }

    /// Simulates a remote edit landing between the fetch and the update.
    struct RacingLibrary(InMemoryLibrary);

    #[async_trait]
    impl Library for RacingLibrary {
        async fn items_since(&self, since: u64) -> crate::library::Result<Vec<Item>> {
            self.0.items_since(since).await
        }
        async fn library_version(&self) -> crate::library::Result<u64> {
            self.0.library_version().await
        }
        async fn item(&self, key: &str) -> crate::library::Result<Item> {
            let item = self.0.item(key).await?;
            self.0.edit(key, |d| d.volume = "7".into());
            Ok(item)
        }
        async fn children(&self, key: &str) -> crate::library::Result<Vec<Item>> {
            self.0.children(key).await
        }
        async fn update_item(
            &self,
            key: &str,
            version: u64,
            update: &FieldUpdate,
        ) -> crate::library::Result<u64> {
            self.0.update_item(key, version, update).await
        }
        async fn create_items(&self, items: &[ItemData]) -> crate::library::Result<CreateResult> {
            self.0.create_items(items).await
        }
        async fn delete_item(&self, key: &str, version: u64) -> crate::library::Result<()> {
            self.0.delete_item(key, version).await
        }
    }

    #[tokio::test]
    async fn test_push_fails_on_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_T.md");
        std::fs::write(&path, note("K1", "New Journal")).unwrap();

        let lib = RacingLibrary(InMemoryLibrary::new());
        lib.0.insert(remote_item());

        let watcher = NoteWatcher::new(dir.path());
        let err = watcher.push_to_library(&lib, &path).await.unwrap_err();
        assert!(err.is_conflict());

        let data = lib.0.get("K1").unwrap().data;
        assert_eq!(data.publication_title, "Old Journal");
        assert_eq!(data.volume, "7");
    }
}
