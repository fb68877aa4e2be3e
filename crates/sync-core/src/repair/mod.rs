//! One-off maintenance commands over the library and the notes folder.
//!
//! Every command takes a dry-run switch, reports what it did (or would do)
//! in a [`RepairReport`], and leaves field policy to `crate::reconcile`.

pub mod dedupe;
pub mod enrich;
pub mod excerpts;
pub mod import;
pub mod ingest;
pub mod migrate;
pub mod reprocess;

use std::path::{Path, PathBuf};

use literature_notes::Note;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::extraction::{CacheError, ExtractedDocument, ExtractionCache};
use crate::fs::list_notes;
use crate::library::{Item, Library, LibraryError};
use crate::pipeline::PipelineError;

pub use dedupe::dedupe;
pub use enrich::{enrich, MetadataError, MetadataSource};
pub use excerpts::{regenerate_excerpts, restructure_excerpts, ExcerptOptions};
pub use import::import_notes;
pub use ingest::ingest;
pub use migrate::migrate_fields;
pub use reprocess::{reprocess, ReprocessOptions};

static SOURCE_PDF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[\[([^\]\n]+?\.pdf)\]\]").expect("valid regex"));

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Note(#[from] literature_notes::NoteError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Counters of one repair run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Candidates looked at.
    pub examined: usize,
    /// Items or notes changed (or that would change in a dry run).
    pub changed: usize,
    /// Notes updated alongside library items.
    pub notes_changed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RepairReport {
    pub fn log(&self, task: &str, dry_run: bool) {
        let mode = if dry_run { " (dry run)" } else { "" };
        info!(
            "{}{}: {} examined, {} changed, {} note(s) changed, {} skipped, {} failed",
            task, mode, self.examined, self.changed, self.notes_changed, self.skipped, self.failed
        );
    }
}

/// Every regular item in the library: no attachments, notes or children.
pub(crate) async fn all_items<L>(library: &L) -> Result<Vec<Item>, LibraryError>
where
    L: Library + ?Sized,
{
    let items = library.items_since(0).await?;
    Ok(items
        .into_iter()
        .filter(|i| i.data.parent_item.is_none())
        .filter(|i| !matches!(i.data.item_type.as_str(), "attachment" | "note"))
        .collect())
}

/// Parse every literature note in `dir`. Unreadable files are logged and left out.
pub(crate) async fn load_notes(dir: &Path) -> Result<Vec<(PathBuf, Note)>, RepairError> {
    let paths = list_notes(dir).await.map_err(|source| RepairError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut notes = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::read_to_string(&path).await {
            Ok(content) => notes.push((path, Note::parse(&content))),
            Err(e) => warn!("Failed to read {}: {}", path.display(), e),
        }
    }
    Ok(notes)
}

/// Cached extraction of the PDF a note links to, matching the name without
/// regard to case.
pub(crate) fn linked_document<'a>(
    content: &str,
    cache: &'a ExtractionCache,
) -> Option<&'a ExtractedDocument> {
    let name = SOURCE_PDF.captures(content)?.get(1)?.as_str().trim();
    cache
        .get(name)
        .or_else(|| cache.iter().find(|d| d.file_name.eq_ignore_ascii_case(name)))
}
