//! Re-run the analysis for notes still holding the fallback placeholders.
//!
//! The note is regenerated in place: its content is kept in memory, the file
//! removed so the writer does not skip it, and the old content put back when
//! no new note is written.

use std::path::Path;

use literature_notes::Note;
use tokio::fs;
use tracing::{info, warn};

use super::import::biblio_from_note;
use super::{linked_document, load_notes, RepairError, RepairReport};
use crate::analysis::{is_thesis, Analyzer, LlmBackend, KEY_CLAIMS_PLACEHOLDER};
use crate::breaker::CircuitBreaker;
use crate::extraction::ExtractionCache;
use crate::fs::atomic_write;
use crate::pipeline::{generate_note, today};
use crate::topics::TopicHubs;

/// Cached text shorter than this is not worth another model call.
pub const MIN_TEXT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReprocessOptions {
    pub dry_run: bool,
    /// Stop after this many notes; `None` means all of them.
    pub limit: Option<usize>,
}

/// Notes whose key claims were never filled in.
pub fn needs_reprocess(content: &str) -> bool {
    content.contains(KEY_CLAIMS_PLACEHOLDER)
}

/// Regenerate every placeholder note whose PDF is in the extraction cache.
///
/// A degraded or failed analysis leaves the note untouched. A rate limit ends
/// the run.
pub async fn reprocess<B>(
    notes_dir: &Path,
    cache: &ExtractionCache,
    analyzer: &Analyzer<B>,
    hubs: &TopicHubs,
    options: ReprocessOptions,
) -> Result<RepairReport, RepairError>
where
    B: LlmBackend,
{
    let mut report = RepairReport::default();
    let mut breaker = CircuitBreaker::new();

    let mut targets = Vec::new();
    for (path, note) in load_notes(notes_dir).await? {
        let content = note.to_markdown();
        if !needs_reprocess(&content) {
            continue;
        }
        let Some(doc) = linked_document(&content, cache) else {
            warn!("No cached text for {}; skipping", path.display());
            report.skipped += 1;
            continue;
        };
        if doc.full_text.trim().chars().count() <= MIN_TEXT_CHARS || is_thesis(doc) {
            report.skipped += 1;
            continue;
        }
        targets.push((path, note, content, doc));
    }
    if let Some(limit) = options.limit {
        targets.truncate(limit);
    }
    report.examined = targets.len();
    info!("{} note(s) to reprocess", targets.len());

    for (n, (path, note, backup, doc)) in targets.into_iter().enumerate() {
        info!("[{}/{}] Reprocessing {}", n + 1, report.examined, path.display());
        if options.dry_run {
            report.changed += 1;
            continue;
        }

        let biblio = biblio_from_note(&note);
        let analysis = match analyzer.analyze(doc, Some(&biblio), hubs, &mut breaker).await {
            Ok(analysis) if !analysis.degraded => analysis,
            Ok(_) => {
                warn!("Analysis of {} fell back to metadata; keeping the note", doc.file_name);
                report.failed += 1;
                continue;
            }
            Err(e) if e.is_rate_limited() => {
                warn!("Rate limited; stopping after {} note(s)", n);
                report.failed += 1;
                break;
            }
            Err(e) => {
                warn!("Analysis of {} failed: {}", doc.file_name, e);
                report.failed += 1;
                continue;
            }
        };

        let zotero_key = note.zotero_key().unwrap_or_default().to_string();
        let created = note
            .header_value("created")
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(today);

        fs::remove_file(&path).await.map_err(|source| RepairError::Io {
            path: path.clone(),
            source,
        })?;
        let written = generate_note(notes_dir, hubs, &analysis, &doc.file_name, &zotero_key, &created).await;
        match written {
            Ok(Some(new_path)) => {
                if new_path != path {
                    info!("{} regenerated as {}", path.display(), new_path.display());
                }
                report.changed += 1;
                continue;
            }
            Ok(None) => report.skipped += 1,
            Err(ref e) => {
                warn!("Failed to regenerate {}: {}", path.display(), e);
                report.failed += 1;
            }
        }
        atomic_write(&path, backup.as_bytes())
            .await
            .map_err(|source| RepairError::Io {
                path: path.clone(),
                source,
            })?;
        info!("Restored {}", path.display());
    }

    report.log("Reprocess", options.dry_run);
    Ok(report)
}
