//! Per-cycle orchestration of the library → notes → library loop.
//!
//! One cycle: poll and classify remote changes, merge fields into notes of
//! already-known items, turn new items into notes one at a time, save the
//! snapshot, then push human edits of notes back to the library.
//!
//! An item moves through `extracting → summarizing → note-written →
//! note-pushed → done`. It ends as created, skipped (a note for the paper
//! already exists) or failed. A failed item stays in the retry queue of the
//! snapshot and is picked up again on the next poll.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use literature_notes::render::title_stem;
use literature_notes::{build_filename, normalize_title, render_note, NoteDraft};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::analysis::{Analysis, AnalysisError, Analyzer, LlmBackend};
use crate::annotation::post_annotation;
use crate::breaker::CircuitBreaker;
use crate::detector::get_new_items;
use crate::extraction::{locate_attachment, CacheError, ExtractedDocument, ExtractionCache, Extractor};
use crate::fs::{atomic_write, list_notes};
use crate::index::NoteIndex;
use crate::library::{Item, Library, LibraryError};
use crate::reconcile::{merge_fields, MergeError};
use crate::state::{ProcessingState, StateError, StateStore};
use crate::topics::TopicHubs;
use crate::watcher::{NoteWatcher, DEFAULT_COOLDOWN};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome counters of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub pushed: usize,
    pub conflicts: usize,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        *self == CycleReport::default()
    }
}

/// How one new item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created(PathBuf),
    /// A note for the same paper already exists.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub notes_dir: PathBuf,
    pub topics_dir: PathBuf,
    pub state_path: PathBuf,
    /// Local attachment storage (`{storage}/{attachment key}/*.pdf`).
    pub storage_dir: Option<PathBuf>,
    /// Attach the analysis to the library item as a child note.
    pub annotate: bool,
    /// How long the watcher ignores files this process wrote.
    pub self_write_cooldown: Duration,
}

impl OrchestratorConfig {
    pub fn new(notes_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        let notes_dir = notes_dir.into();
        let topics_dir = notes_dir.clone();
        Self {
            notes_dir,
            topics_dir,
            state_path: state_path.into(),
            storage_dir: None,
            annotate: true,
            self_write_cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Write a new note for an analysis.
///
/// Returns `None` without writing when the target file exists or a note of the
/// same year already carries the title prefix in its name. Topic hubs the
/// analysis assigned are created if missing.
pub async fn generate_note(
    notes_dir: &Path,
    hubs: &TopicHubs,
    analysis: &Analysis,
    source_file: &str,
    zotero_key: &str,
    created: &str,
) -> Result<Option<PathBuf>, PipelineError> {
    let biblio = &analysis.biblio;
    let file_name = build_filename(&biblio.year, &biblio.title);
    let path = notes_dir.join(&file_name);

    let exists = fs::try_exists(&path).await.map_err(|source| PipelineError::Io {
        path: path.clone(),
        source,
    })?;
    if exists {
        info!("Skipping {}: note already exists", file_name);
        return Ok(None);
    }

    let year = biblio.year.trim();
    let stem = title_stem(&biblio.title);
    if !year.is_empty() && !stem.is_empty() {
        let prefix = format!("@{year}_");
        let existing = list_notes(notes_dir).await.map_err(|source| PipelineError::Io {
            path: notes_dir.to_path_buf(),
            source,
        })?;
        let similar = existing.iter().find_map(|p| {
            let name = p.file_name()?.to_string_lossy().to_string();
            (name.starts_with(&prefix) && name.to_lowercase().contains(&stem)).then_some(name)
        });
        if let Some(similar) = similar {
            info!("Skipping {}: similar note {} exists", file_name, similar);
            return Ok(None);
        }
    }

    let mut topics = Vec::new();
    for assignment in &analysis.topics {
        match hubs.ensure(&assignment.name, &assignment.description).await {
            Ok((name, _)) => topics.push(name),
            Err(e) => warn!("Failed to create topic hub {}: {}", assignment.name, e),
        }
    }

    let draft = NoteDraft {
        biblio: biblio.clone(),
        created: created.to_string(),
        zotero_key: zotero_key.to_string(),
        abstract_text: analysis.abstract_text.clone(),
        key_claims: analysis.key_claims.clone(),
        method: analysis.method.clone(),
        findings: analysis.findings.clone(),
        excerpts: analysis.excerpts.clone(),
        topics,
        source_file: source_file.to_string(),
    };
    atomic_write(&path, render_note(&draft).as_bytes())
        .await
        .map_err(|source| PipelineError::Io {
            path: path.clone(),
            source,
        })?;
    info!("Created {}", file_name);
    Ok(Some(path))
}

/// Today's date as written into the `created:` header.
pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Owns every component of the sync loop.
pub struct Orchestrator<L, B> {
    library: L,
    analyzer: Analyzer<B>,
    extractor: Arc<dyn Extractor>,
    cache: Option<ExtractionCache>,
    breaker: CircuitBreaker,
    store: StateStore,
    state: ProcessingState,
    index: NoteIndex,
    watcher: NoteWatcher,
    hubs: TopicHubs,
    config: OrchestratorConfig,
}

impl<L: Library, B: LlmBackend> Orchestrator<L, B> {
    /// Build the orchestrator and load the snapshot.
    pub async fn open(
        library: L,
        analyzer: Analyzer<B>,
        extractor: Arc<dyn Extractor>,
        config: OrchestratorConfig,
    ) -> Self {
        let store = StateStore::new(&config.state_path);
        let state = store.load().await;
        info!(
            "Loaded state: version {}, {} processed item(s), {} pending retry",
            state.last_version,
            state.processed_keys.len(),
            state.retry_keys.len()
        );
        Self {
            library,
            analyzer,
            extractor,
            cache: None,
            breaker: CircuitBreaker::new(),
            store,
            state,
            index: NoteIndex::new(&config.notes_dir),
            watcher: NoteWatcher::with_cooldown(&config.notes_dir, config.self_write_cooldown),
            hubs: TopicHubs::new(&config.topics_dir),
            config,
        }
    }

    /// Reuse and extend an extraction cache when processing attachments.
    pub fn with_cache(mut self, cache: ExtractionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn library(&self) -> &L {
        &self.library
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Record the current notes as the watcher baseline, so edits made while
    /// the daemon was stopped are not pushed.
    pub async fn prime(&mut self) {
        match self.watcher.scan().await {
            Ok(_) => debug!("Watching {} note(s)", self.watcher.tracked()),
            Err(e) => warn!("Initial note scan failed: {}", e),
        }
    }

    pub async fn save_state(&self) -> Result<(), StateError> {
        self.store.save(&self.state).await
    }

    async fn save_state_logged(&self) {
        if let Err(e) = self.save_state().await {
            warn!("Failed to save state: {}", e);
        }
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        if let Err(e) = self.index.begin_cycle().await {
            warn!("Failed to index notes: {}", e);
        }

        let classification = get_new_items(&self.library, &mut self.state).await;
        report.duplicates = classification.duplicates.len();

        for item in &classification.already_known {
            match merge_fields(item, &mut self.index, &mut self.watcher).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to merge item {}: {}", item.key, e);
                    report.failed += 1;
                }
            }
        }

        for item in classification.new_items.iter().chain(&classification.deferred) {
            self.state.enqueue_retry(&item.key);
        }
        self.save_state_logged().await;

        if classification.new_items.is_empty() {
            debug!("No new items");
        } else {
            info!("Found {} new item(s)", classification.new_items.len());
        }
        for (i, item) in classification.new_items.iter().enumerate() {
            match self.process_item(item).await {
                Ok(ItemOutcome::Created(_)) => report.created += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Err(PipelineError::Analysis(e)) if e.is_rate_limited() => {
                    let left = classification.new_items.len() - i - 1;
                    warn!(
                        "Rate limited on item {}: {}; leaving it and {} more for the next poll",
                        item.key, e, left
                    );
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    warn!("Failed to process item {}: {}; will retry", item.key, e);
                    report.failed += 1;
                }
            }
        }

        self.save_state_logged().await;

        let changed = match self.watcher.scan().await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Note scan failed: {}", e);
                Vec::new()
            }
        };
        for path in changed {
            match self.watcher.push_to_library(&self.library, &path).await {
                Ok(true) => report.pushed += 1,
                Ok(false) => {}
                Err(e) if e.is_conflict() => {
                    warn!("Not pushing {}: {}", path.display(), e);
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!("Failed to push {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        if report.is_quiet() {
            debug!("Cycle finished with nothing to do");
        } else {
            info!(
                "Cycle finished: {} created, {} updated, {} skipped, {} failed, {} duplicate(s), {} pushed, {} conflict(s)",
                report.created,
                report.updated,
                report.skipped,
                report.failed,
                report.duplicates,
                report.pushed,
                report.conflicts
            );
        }
        report
    }

    /// Turn one new item into a note and record it as processed.
    pub async fn process_item(&mut self, item: &Item) -> Result<ItemOutcome, PipelineError> {
        let title: String = item.data.title.chars().take(60).collect();
        info!("Processing {} \"{}\"", item.key, title);

        // A note written outside the loop (e.g. by import) already covers the item.
        let existing = self
            .index
            .locate(&item.key)
            .await
            .map_err(|source| PipelineError::Io {
                path: self.config.notes_dir.clone(),
                source,
            })?;
        if let Some(path) = existing {
            info!("{} already references {}; merging instead", path.display(), item.key);
            merge_fields(item, &mut self.index, &mut self.watcher).await?;
            self.state
                .mark_processed(&item.key, &normalize_title(&item.data.title));
            self.save_state_logged().await;
            return Ok(ItemOutcome::Skipped);
        }

        debug!("[{}] extracting", item.key);
        let doc = self.extract_for(item).await?;

        debug!("[{}] summarizing", item.key);
        let biblio = item.data.biblio();
        let analysis = self
            .analyzer
            .analyze(&doc, Some(&biblio), &self.hubs, &mut self.breaker)
            .await?;

        let written = generate_note(
            &self.config.notes_dir,
            &self.hubs,
            &analysis,
            &doc.file_name,
            &item.key,
            &today(),
        )
        .await?;
        debug!("[{}] note written", item.key);

        let outcome = match written {
            Some(path) => {
                self.index.insert(&item.key, &path);
                self.watcher.mark_self_modified(&path).await;
                if self.config.annotate {
                    if let Err(e) = post_annotation(&self.library, &item.key, &analysis).await {
                        warn!("Failed to attach analysis note to {}: {}", item.key, e);
                    } else {
                        debug!("[{}] note pushed", item.key);
                    }
                }
                ItemOutcome::Created(path)
            }
            None => ItemOutcome::Skipped,
        };

        self.state
            .mark_processed(&item.key, &normalize_title(&item.data.title));
        self.save_state_logged().await;
        debug!("[{}] done", item.key);
        Ok(outcome)
    }

    /// Text of the item's PDF, or a placeholder when there is none.
    async fn extract_for(&mut self, item: &Item) -> Result<ExtractedDocument, PipelineError> {
        let placeholder = ExtractedDocument::placeholder(format!("{}.pdf", item.key));
        let Some(storage) = self.config.storage_dir.as_deref() else {
            return Ok(placeholder);
        };

        let path = match locate_attachment(&self.library, &item.key, storage).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!("No local PDF for {}; using library metadata only", item.key);
                return Ok(placeholder);
            }
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!("Attachment lookup for {} failed: {}", item.key, e);
                return Ok(placeholder);
            }
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.pdf", item.key));

        if let Some(doc) = self.cache.as_ref().and_then(|c| c.get(&file_name)) {
            debug!("Using cached extraction of {}", file_name);
            return Ok(doc.clone());
        }

        let extractor = Arc::clone(&self.extractor);
        let job_path = path.clone();
        match tokio::task::spawn_blocking(move || extractor.extract(&job_path)).await {
            Ok(Ok(doc)) => {
                if let Some(cache) = self.cache.as_mut() {
                    if let Err(e) = cache.append(doc.clone()).await {
                        warn!("Failed to cache extraction of {}: {}", file_name, e);
                    }
                }
                Ok(doc)
            }
            Ok(Err(e)) => {
                warn!("Failed to extract {}: {}", path.display(), e);
                Ok(ExtractedDocument::placeholder(file_name))
            }
            Err(e) => {
                warn!("Extraction of {} did not complete: {}", path.display(), e);
                Ok(ExtractedDocument::placeholder(file_name))
            }
        }
    }

    /// Poll until `shutdown` resolves. The shutdown signal is only observed
    /// between cycles; the snapshot is saved before returning.
    pub async fn run<F>(&mut self, interval: Duration, shutdown: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        self.prime().await;
        tokio::pin!(shutdown);

        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.save_state().await?;
        info!("State saved to {}", self.store.path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LlmError;
    use crate::extraction::ExtractError;
    use crate::library::{FieldUpdate, InMemoryLibrary, ItemData, RemoteField};
    use crate::repair::import::{import_notes, ImportOptions};
    use async_trait::async_trait;
    use literature_notes::{CitationField, Note};
    use std::collections::VecDeque;
    use std::fs::File;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const ANALYSIS: &str = r####"{"abstract": "Abstract text", "key_claims": ["Claim"],
        "method": "Experiment", "findings": ["1. Result"], "excerpts": "### **Paper analysis**",
        "tags": ["Deep Learning"], "topic_assignments": [{"name": "MOC_AI", "is_new": true}]}"####;

    /// Answers every call with the same analysis unless a scripted error is queued.
    #[derive(Default)]
    struct TestBackend {
        errors: Mutex<VecDeque<LlmError>>,
        calls: AtomicUsize,
    }

    impl TestBackend {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for TestBackend {
        async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.errors.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok(ANALYSIS.to_string()),
            }
        }
    }

    struct TextExtractor;

    impl Extractor for TextExtractor {
        fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError> {
            Ok(ExtractedDocument {
                file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
                page_count: 8,
                full_text: "Abstract: From the PDF.\n\nBody".into(),
                ..Default::default()
            })
        }
    }

    fn article(key: &str, title: &str, year: &str) -> ItemData {
        ItemData {
            key: key.into(),
            item_type: "journalArticle".into(),
            title: title.into(),
            date: year.into(),
            ..Default::default()
        }
    }

    struct Fixture {
        dir: TempDir,
        orchestrator: Orchestrator<InMemoryLibrary, TestBackend>,
    }

    impl Fixture {
        async fn new(library: InMemoryLibrary) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config =
                OrchestratorConfig::new(dir.path().join("notes"), dir.path().join("state.json"));
            config.topics_dir = dir.path().join("hubs");
            config.storage_dir = Some(dir.path().join("storage"));
            config.self_write_cooldown = Duration::ZERO;
            let analyzer = Analyzer::new(TestBackend::default(), "full", "lite");
            let orchestrator =
                Orchestrator::open(library, analyzer, Arc::new(TextExtractor), config).await;
            Self { dir, orchestrator }
        }

        fn notes_dir(&self) -> PathBuf {
            self.dir.path().join("notes")
        }

        fn note(&self, name: &str) -> String {
            std::fs::read_to_string(self.notes_dir().join(name)).unwrap()
        }

        fn saved_state(&self) -> ProcessingState {
            let raw = std::fs::read_to_string(self.dir.path().join("state.json")).unwrap();
            serde_json::from_str(&raw).unwrap()
        }
    }

    // ==================== generate_note tests ====================

    #[tokio::test]
    async fn test_generate_note_skips_existing_and_similar() {
        let dir = TempDir::new().unwrap();
        let hubs = TopicHubs::new(dir.path().join("hubs"));
        let mut analysis = Analysis::default();
        analysis.biblio.title = "Deep Learning for X: Extended".into();
        analysis.biblio.year = "2023".into();

        let first = generate_note(dir.path(), &hubs, &analysis, "a.pdf", "K1", "2024-01-01")
            .await
            .unwrap();
        assert_eq!(first, Some(dir.path().join("@2023_Deep-Learning-for-X-Extended.md")));

        let again = generate_note(dir.path(), &hubs, &analysis, "a.pdf", "K1", "2024-01-01")
            .await
            .unwrap();
        assert_eq!(again, None);

        analysis.biblio.title = "Deep Learning for X".into();
        let similar = generate_note(dir.path(), &hubs, &analysis, "a.pdf", "K2", "2024-01-01")
            .await
            .unwrap();
        assert_eq!(similar, None);

        analysis.biblio.year = "2024".into();
        let other_year = generate_note(dir.path(), &hubs, &analysis, "a.pdf", "K3", "2024-01-01")
            .await
            .unwrap();
        assert!(other_year.is_some());
    }

    // ==================== cycle tests ====================

    #[tokio::test]
    async fn test_new_item_becomes_note() {
        let lib = InMemoryLibrary::new();
        lib.insert(ItemData {
            creators: vec![crate::library::Creator::author("Doe", "Jane")],
            publication_title: "Journal of X".into(),
            ..article("K1", "Deep Learning for X", "2023")
        });
        lib.insert(ItemData {
            key: "ATT1".into(),
            item_type: "attachment".into(),
            content_type: "application/pdf".into(),
            parent_item: Some("K1".into()),
            ..Default::default()
        });
        let mut fx = Fixture::new(lib).await;
        let att_dir = fx.dir.path().join("storage/ATT1");
        std::fs::create_dir_all(&att_dir).unwrap();
        std::fs::write(att_dir.join("paper.pdf"), "").unwrap();

        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);

        let content = fx.note("@2023_Deep-Learning-for-X.md");
        let note = Note::parse(&content);
        assert_eq!(note.zotero_key(), Some("K1"));
        assert_eq!(note.citation_value(CitationField::Author), Some("Doe, Jane"));
        assert_eq!(note.citation_value(CitationField::Journal), Some("Journal of X"));
        assert!(content.contains("## Abstract\nAbstract text\n"));
        assert!(content.contains("- MOC: [[MOC_AI]]"));
        assert!(content.contains("**Source file**: [[paper.pdf]]"));
        assert!(fx.dir.path().join("hubs/MOC_AI.md").exists());

        let state = fx.saved_state();
        assert!(state.is_processed("K1"));
        assert!(state.has_title("deep learning for x"));
        assert!(state.retry_keys.is_empty());

        let children = fx.orchestrator.library().children("K1").await.unwrap();
        assert!(children.iter().any(|c| c.data.item_type == "note"));
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "One Paper", "2021"));
        let mut fx = Fixture::new(lib).await;

        assert_eq!(fx.orchestrator.run_cycle().await.created, 1);
        let before = fx.note("@2021_One-Paper.md");

        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 0);
        assert_eq!(fx.note("@2021_One-Paper.md"), before);
        assert_eq!(list_notes(&fx.notes_dir()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_doi_fills_blank_note_fields() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Deep Learning for X", "2023"));
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator.run_cycle().await;
        let before = fx.note("@2023_Deep-Learning-for-X.md");

        fx.orchestrator
            .library()
            .edit("K1", |d| d.doi = "10.1000/abc".into());
        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.pushed, 0);

        let after = fx.note("@2023_Deep-Learning-for-X.md");
        let changed: Vec<_> = after
            .lines()
            .zip(before.lines())
            .filter(|(a, b)| a != b)
            .map(|(a, _)| a)
            .collect();
        assert_eq!(changed, vec!["doi: 10.1000/abc", "- **DOI**: 10.1000/abc"]);
    }

    #[tokio::test]
    async fn test_title_duplicate_gets_no_note() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Same Paper", "2020"));
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator.run_cycle().await;

        fx.orchestrator
            .library()
            .insert(article("K2", "same  paper", "2020"));
        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.created, 0);
        assert!(fx.orchestrator.state().is_processed("K2"));
        assert_eq!(list_notes(&fx.notes_dir()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_title_in_one_batch_resolves_next_cycle() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Twin", "2020"));
        lib.insert(article("K2", "Twin", "2020"));
        let mut fx = Fixture::new(lib).await;

        let first = fx.orchestrator.run_cycle().await;
        assert_eq!(first.created, 1);
        assert!(fx.orchestrator.state().retry_keys.contains("K2"));

        let second = fx.orchestrator.run_cycle().await;
        assert_eq!(second.duplicates, 1);
        assert!(fx.orchestrator.state().retry_keys.is_empty());
        assert_eq!(list_notes(&fx.notes_dir()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_analysis_failure_is_retried() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Flaky", "2022"));
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator
            .analyzer
            .backend()
            .errors
            .lock()
            .unwrap()
            .push_back(LlmError::RateLimited("429".into()));

        let first = fx.orchestrator.run_cycle().await;
        assert_eq!(first.failed, 1);
        assert!(fx.saved_state().retry_keys.contains("K1"));
        assert!(!fx.saved_state().is_processed("K1"));

        let second = fx.orchestrator.run_cycle().await;
        assert_eq!(second.created, 1);
        assert!(fx.saved_state().is_processed("K1"));
    }

    #[tokio::test]
    async fn test_rate_limit_defers_rest_of_batch() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "First", "2020"));
        lib.insert(article("K2", "Second", "2020"));
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator
            .analyzer
            .backend()
            .errors
            .lock()
            .unwrap()
            .push_back(LlmError::RateLimited("429".into()));

        let first = fx.orchestrator.run_cycle().await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.created, 0);
        assert_eq!(fx.orchestrator.analyzer.backend().calls(), 1);
        let state = fx.saved_state();
        assert!(state.retry_keys.contains("K1"));
        assert!(state.retry_keys.contains("K2"));

        let second = fx.orchestrator.run_cycle().await;
        assert_eq!(second.created, 2);
        assert!(fx.saved_state().retry_keys.is_empty());
    }

    #[tokio::test]
    async fn test_restart_resumes_interrupted_item() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Finished", "2022"));
        let mut fx = Fixture::new(lib).await;
        assert_eq!(fx.orchestrator.run_cycle().await.created, 1);
        let finished = fx.note("@2022_Finished.md");

        // Simulate a crash after classifying K2: version advanced, K2 queued, no note yet.
        fx.orchestrator.state.last_version = 100;
        fx.orchestrator.state.enqueue_retry("K2");
        fx.orchestrator.save_state().await.unwrap();

        let config = fx.orchestrator.config.clone();
        let library = InMemoryLibrary::new();
        library.insert(article("K1", "Finished", "2022"));
        library.insert(article("K2", "Pending", "2022"));
        let analyzer = Analyzer::new(TestBackend::default(), "full", "lite");
        let mut restarted =
            Orchestrator::open(library, analyzer, Arc::new(TextExtractor), config).await;

        let report = restarted.run_cycle().await;
        assert_eq!(report.created, 1);
        assert_eq!(restarted.analyzer.backend().calls(), 1);
        assert!(restarted.state().is_processed("K1"));
        assert!(restarted.state().is_processed("K2"));
        assert!(restarted.state().retry_keys.is_empty());
        assert_eq!(fx.note("@2022_Finished.md"), finished);
        assert!(fx.notes_dir().join("@2022_Pending.md").exists());
        assert_eq!(list_notes(&fx.notes_dir()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_imported_notes_are_adopted_not_regenerated() {
        let mut fx = Fixture::new(InMemoryLibrary::new()).await;
        let notes = fx.notes_dir();
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(
            notes.join("@2019_Legacy-Paper.md"),
            "---\ntitle: \"Legacy Paper\"\nyear: 2019\ntags: [literature, paper]\ncreated: 2023-01-01\n---\n\n\
             ## Citation\n- **Author**: Doe, Jane\n- **Journal**: J. Tests\n- **Volume**: \n",
        )
        .unwrap();
        std::fs::write(
            notes.join("@_Undated-Paper.md"),
            "---\ntitle: \"Undated Paper\"\ntags: [literature, paper]\ncreated: 2023-01-01\n---\n\n\
             ## Citation\n- **Author**: Roe, Rick\n",
        )
        .unwrap();

        let imported = import_notes(fx.orchestrator.library(), &notes, &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(imported.changed, 2);

        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(fx.orchestrator.analyzer.backend().calls(), 0);

        let paths = list_notes(&notes).await.unwrap();
        assert_eq!(paths.len(), 2);
        let state = fx.saved_state();
        for path in &paths {
            let note = Note::parse(&std::fs::read_to_string(path).unwrap());
            assert!(state.is_processed(note.zotero_key().unwrap()));
        }

        let again = fx.orchestrator.run_cycle().await;
        assert_eq!(again.created, 0);
        assert_eq!(fx.orchestrator.analyzer.backend().calls(), 0);
        assert_eq!(list_notes(&notes).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_human_edit_is_pushed() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Editable", "2022"));
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator.prime().await;
        fx.orchestrator.run_cycle().await;

        let path = fx.notes_dir().join("@2022_Editable.md");
        let content = fx.note("@2022_Editable.md").replace("- **Volume**: ", "- **Volume**: 7");
        std::fs::write(&path, content).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.conflicts, 0);
        let item = fx.orchestrator.library().get("K1").unwrap();
        assert_eq!(item.data.get(RemoteField::Volume), "7");
        assert_eq!(item.data.tag_names(), vec!["deep-learning"]);
    }

    #[tokio::test]
    async fn test_run_saves_state_on_shutdown() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Paper", "2020"));
        let mut fx = Fixture::new(lib).await;

        fx.orchestrator
            .run(Duration::from_secs(3600), async {})
            .await
            .unwrap();
        assert!(fx.saved_state().is_processed("K1"));
    }

    #[tokio::test]
    async fn test_merge_leaves_populated_fields() {
        let lib = InMemoryLibrary::new();
        lib.insert(ItemData {
            volume: "1".into(),
            ..article("K1", "Stable", "2020")
        });
        let mut fx = Fixture::new(lib).await;
        fx.orchestrator.run_cycle().await;

        let update = {
            let mut u = FieldUpdate::default();
            u.set(RemoteField::Volume, "2");
            u
        };
        let version = fx.orchestrator.library().get("K1").unwrap().version;
        fx.orchestrator
            .library()
            .update_item("K1", version, &update)
            .await
            .unwrap();

        let report = fx.orchestrator.run_cycle().await;
        assert_eq!(report.updated, 0);
        let note = Note::parse(&fx.note("@2020_Stable.md"));
        assert_eq!(note.citation_value(CitationField::Volume), Some("1"));
    }
}
