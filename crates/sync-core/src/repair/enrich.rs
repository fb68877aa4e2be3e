//! Fill blank bibliographic fields from an external metadata source.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use literature_notes::{Biblio, Note};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{all_items, RepairError, RepairReport};
use crate::fs::atomic_write;
use crate::index::NoteIndex;
use crate::library::{Item, Library, RemoteField};
use crate::reconcile::{fill_blank_note_fields, remote_backfill};

/// Item fields an external source can fill.
pub const ENRICHABLE_FIELDS: [RemoteField; 8] = [
    RemoteField::Doi,
    RemoteField::Volume,
    RemoteField::Issue,
    RemoteField::Pages,
    RemoteField::Issn,
    RemoteField::Publisher,
    RemoteField::Url,
    RemoteField::Language,
];

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata source unavailable: {0}")]
    Transient(String),

    #[error("unexpected metadata response: {0}")]
    Malformed(String),
}

/// Bibliographic lookup service, e.g. CrossRef.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn by_doi(&self, doi: &str) -> Result<Option<Biblio>, MetadataError>;

    /// Best match for a title and first author surname.
    async fn search(&self, title: &str, author: &str) -> Result<Option<Biblio>, MetadataError>;
}

#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
    /// Pause after every lookup.
    pub delay: Duration,
}

/// Whether a search hit plausibly is the queried paper: one of the first
/// three words of the query title appears in the hit's title.
pub fn plausible_match(query_title: &str, found_title: &str) -> bool {
    if query_title.trim().is_empty() || found_title.trim().is_empty() {
        return true;
    }
    let found = found_title.to_lowercase();
    query_title
        .to_lowercase()
        .split_whitespace()
        .take(3)
        .any(|word| found.contains(word))
}

fn first_author_surname(item: &Item) -> String {
    item.data
        .creators
        .iter()
        .find(|c| c.creator_type == "author")
        .map(|c| {
            if c.last_name.trim().is_empty() {
                c.name.trim().to_string()
            } else {
                c.last_name.trim().to_string()
            }
        })
        .unwrap_or_default()
}

fn needs_enrichment(item: &Item) -> bool {
    ENRICHABLE_FIELDS
        .iter()
        .any(|f| item.data.get(*f).trim().is_empty())
}

async fn lookup<M>(source: &M, item: &Item) -> Result<Option<Biblio>, MetadataError>
where
    M: MetadataSource + ?Sized,
{
    let doi = item.data.doi.trim();
    if !doi.is_empty() {
        if let Some(found) = source.by_doi(doi).await? {
            return Ok(Some(found));
        }
        debug!("DOI {} not found; searching by title", doi);
    }

    let title = item.data.title.trim();
    let found = source.search(title, &first_author_surname(item)).await?;
    Ok(found.filter(|f| {
        let plausible = plausible_match(title, &f.title);
        if !plausible {
            debug!("Discarding search hit \"{}\" for \"{}\"", f.title, title);
        }
        plausible
    }))
}

/// Only the fields an external source may contribute.
fn enrichable_values(found: &Biblio) -> Biblio {
    Biblio {
        doi: found.doi.clone(),
        volume: found.volume.clone(),
        issue: found.issue.clone(),
        pages: found.pages.clone(),
        issn: found.issn.clone(),
        publisher: found.publisher.clone(),
        url: found.url.clone(),
        language: found.language.clone(),
        ..Default::default()
    }
}

/// Look up every item with blank fields, fill them on the item (never
/// overwriting) and fill the same blanks in the item's note.
pub async fn enrich<L, M>(
    library: &L,
    source: &M,
    notes_dir: &Path,
    options: &EnrichOptions,
) -> Result<RepairReport, RepairError>
where
    L: Library + ?Sized,
    M: MetadataSource + ?Sized,
{
    let mut report = RepairReport::default();
    let mut targets: Vec<Item> = all_items(library)
        .await?
        .into_iter()
        .filter(needs_enrichment)
        .collect();
    if let Some(limit) = options.limit {
        targets.truncate(limit);
    }
    report.examined = targets.len();
    info!("{} item(s) with blank bibliographic fields", targets.len());

    let mut index = NoteIndex::new(notes_dir);
    if let Err(e) = index.rebuild().await {
        warn!("Failed to index notes in {}: {}", notes_dir.display(), e);
    }

    for (n, item) in targets.iter().enumerate() {
        debug!("[{}/{}] {}", n + 1, targets.len(), item.data.title);
        let found = lookup(source, item).await;
        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
        let found = match found {
            Ok(Some(found)) => enrichable_values(&found),
            Ok(None) => {
                debug!("No metadata found for {}", item.key);
                report.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!("Lookup for {} failed: {}", item.key, e);
                report.failed += 1;
                continue;
            }
        };

        let update = remote_backfill(&item.data, &found);
        if update.is_empty() {
            report.skipped += 1;
            continue;
        }
        if options.dry_run {
            info!("Would fill {} on {}", update.field_names().join(", "), item.key);
            report.changed += 1;
            continue;
        }

        if let Err(e) = library.update_item(&item.key, item.version, &update).await {
            warn!("Failed to update {}: {}", item.key, e);
            report.failed += 1;
            continue;
        }
        info!("Filled {} on {}", update.field_names().join(", "), item.key);
        report.changed += 1;

        let Some(path) = index.get(&item.key).map(Path::to_path_buf) else {
            continue;
        };
        let content = fs::read_to_string(&path).await.map_err(|source| RepairError::Io {
            path: path.clone(),
            source,
        })?;
        let mut note = Note::parse(&content);
        let fill = fill_blank_note_fields(&mut note, &found);
        if fill.is_empty() {
            continue;
        }
        atomic_write(&path, note.to_markdown().as_bytes())
            .await
            .map_err(|source| RepairError::Io {
                path: path.clone(),
                source,
            })?;
        debug!("Filled {} in {}", fill.describe(), path.display());
        report.notes_changed += 1;
    }

    report.log("Enrich", options.dry_run);
    Ok(report)
}
