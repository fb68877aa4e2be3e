//! Create library items for notes that were written before sync existed.

use std::path::Path;
use std::time::Duration;

use literature_notes::render::BASE_TAGS;
use literature_notes::{Biblio, CitationField, Note};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::{load_notes, RepairError, RepairReport};
use crate::fs::atomic_write;
use crate::library::{ItemData, Library, RemoteField, Tag};
use crate::reconcile::parse_author_string;

/// Largest batch the library accepts in one create call.
pub const BATCH_SIZE: usize = 50;

static FOUR_DIGIT_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").expect("valid regex"));

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub batch_delay: Duration,
}

/// Bibliographic values stored in a note's header and Citation section.
pub fn biblio_from_note(note: &Note) -> Biblio {
    let citation = |field| note.citation_value(field).unwrap_or_default().to_string();
    let year = note.year().unwrap_or_default();
    let doi = note
        .header_value("doi")
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| citation(CitationField::Doi));

    Biblio {
        title: note.title().unwrap_or_default().trim().to_string(),
        author: citation(CitationField::Author),
        year: if FOUR_DIGIT_YEAR.is_match(year.trim()) { year.trim().to_string() } else { String::new() },
        journal: citation(CitationField::Journal),
        publisher: citation(CitationField::Publisher),
        volume: citation(CitationField::Volume),
        issue: citation(CitationField::Issue),
        pages: citation(CitationField::Pages),
        doi,
        issn: citation(CitationField::Issn),
        url: citation(CitationField::Url),
        language: citation(CitationField::Language),
        abstract_note: String::new(),
        tags: note
            .tags()
            .into_iter()
            .filter(|t| !BASE_TAGS.contains(&t.as_str()))
            .collect(),
    }
}

/// New journal article item for a note's values.
pub fn item_from_biblio(biblio: &Biblio) -> ItemData {
    let mut data = ItemData {
        item_type: "journalArticle".to_string(),
        title: biblio.title.clone(),
        creators: parse_author_string(&biblio.author),
        tags: biblio.tags.iter().map(Tag::new).collect(),
        ..Default::default()
    };
    let fields = [
        (RemoteField::Date, &biblio.year),
        (RemoteField::PublicationTitle, &biblio.journal),
        (RemoteField::Publisher, &biblio.publisher),
        (RemoteField::Volume, &biblio.volume),
        (RemoteField::Issue, &biblio.issue),
        (RemoteField::Pages, &biblio.pages),
        (RemoteField::Doi, &biblio.doi),
        (RemoteField::Issn, &biblio.issn),
        (RemoteField::Url, &biblio.url),
        (RemoteField::Language, &biblio.language),
    ];
    for (field, value) in fields {
        data.set(field, value.clone());
    }
    data
}

/// Create an item for every note without a `zotero_key` and write the new
/// key back into the note header.
pub async fn import_notes<L>(
    library: &L,
    notes_dir: &Path,
    options: &ImportOptions,
) -> Result<RepairReport, RepairError>
where
    L: Library + ?Sized,
{
    let mut report = RepairReport::default();
    let mut candidates = Vec::new();

    for (path, note) in load_notes(notes_dir).await? {
        if !note.has_header() || note.zotero_key().is_some() {
            report.skipped += 1;
            continue;
        }
        let biblio = biblio_from_note(&note);
        if biblio.title.is_empty() {
            warn!("{} has no title; not importing", path.display());
            report.skipped += 1;
            continue;
        }
        candidates.push((path, note, biblio));
    }
    if let Some(limit) = options.limit {
        candidates.truncate(limit);
    }
    report.examined = candidates.len();

    if options.dry_run {
        for (path, _, biblio) in &candidates {
            info!("Would import {} as \"{}\"", path.display(), biblio.title);
        }
        report.changed = candidates.len();
        return Ok(report);
    }

    let batch_count = candidates.len().div_ceil(BATCH_SIZE);
    for (batch_no, batch) in candidates.chunks_mut(BATCH_SIZE).enumerate() {
        if batch_no > 0 && !options.batch_delay.is_zero() {
            tokio::time::sleep(options.batch_delay).await;
        }
        info!("Importing batch {}/{} ({} note(s))", batch_no + 1, batch_count, batch.len());

        let items: Vec<ItemData> = batch.iter().map(|(_, _, b)| item_from_biblio(b)).collect();
        let result = match library.create_items(&items).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Batch {} failed: {}", batch_no + 1, e);
                report.failed += batch.len();
                continue;
            }
        };

        for (idx, (path, note, _)) in batch.iter_mut().enumerate() {
            let Some(key) = result.created.get(&idx) else {
                let reason = result.failed.get(&idx).map(String::as_str).unwrap_or("no key returned");
                warn!("Library rejected {}: {}", path.display(), reason);
                report.failed += 1;
                continue;
            };
            if let Err(e) = note.fill_header("zotero_key", key) {
                warn!("Cannot record key {} in {}: {}", key, path.display(), e);
                report.failed += 1;
                continue;
            }
            atomic_write(path, note.to_markdown().as_bytes())
                .await
                .map_err(|source| RepairError::Io {
                    path: path.clone(),
                    source,
                })?;
            report.changed += 1;
            report.notes_changed += 1;
        }
    }

    report.log("Import", false);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::InMemoryLibrary;
    use tempfile::TempDir;

    fn legacy_note(title: &str) -> String {
        format!(
            "---\ntitle: \"{title}\"\nyear: 2019\ntags: [literature, paper, nlp]\ncreated: 2023-01-01\n---\n\n\
             ## Citation\n- **Author**: Doe, Jane; Roe, Rick\n- **Journal**: J. Tests\n- **DOI**: 10.1/abc\n- **Volume**: \n"
        )
    }

    #[test]
    fn test_biblio_from_note() {
        let note = Note::parse(&legacy_note("A Study"));
        let biblio = biblio_from_note(&note);
        assert_eq!(biblio.title, "A Study");
        assert_eq!(biblio.year, "2019");
        assert_eq!(biblio.journal, "J. Tests");
        assert_eq!(biblio.doi, "10.1/abc");
        assert_eq!(biblio.volume, "");
        assert_eq!(biblio.tags, vec!["nlp"]);

        let item = item_from_biblio(&biblio);
        assert_eq!(item.creators.len(), 2);
        assert_eq!(item.creators[0].last_name, "Doe");
        assert_eq!(item.date, "2019");
        assert_eq!(item.doi, "10.1/abc");
    }

    #[tokio::test]
    async fn test_import_writes_keys_back() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("@2019_A.md"), legacy_note("A Study")).unwrap();
        std::fs::write(dir.path().join("@2019_B.md"), legacy_note("B Study")).unwrap();
        std::fs::write(
            dir.path().join("@2019_C.md"),
            "---\ntitle: \"C\"\nzotero_key: OLD1\n---\n",
        )
        .unwrap();
        let lib = InMemoryLibrary::new();

        let report = import_notes(&lib, dir.path(), &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.changed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(lib.len(), 2);

        let content = std::fs::read_to_string(dir.path().join("@2019_A.md")).unwrap();
        let note = Note::parse(&content);
        let key = note.zotero_key().unwrap();
        assert_eq!(lib.get(key).unwrap().data.title, "A Study");
        assert!(content.contains(&format!("created: 2023-01-01\nzotero_key: {key}\n")));

        let again = import_notes(&lib, dir.path(), &ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(lib.len(), 2);
    }

    #[tokio::test]
    async fn test_import_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("@2019_A.md"), legacy_note("A Study")).unwrap();
        let lib = InMemoryLibrary::new();
        let options = ImportOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = import_notes(&lib, dir.path(), &options).await.unwrap();
        assert_eq!(report.changed, 1);
        assert!(lib.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("@2019_A.md")).unwrap(),
            legacy_note("A Study")
        );
    }
}
