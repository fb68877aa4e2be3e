//! Field-level reconciliation between notes and library items.
//!
//! This module is the one place that decides which fields move in which
//! direction. The live sync loop and the repair commands both go through it.
//!
//! - Library → note: `fill_blank_note_fields` / `merge_fields` fill citation
//!   lines that are blank. Populated lines are never touched.
//! - Note → library: `push_diff` sends note values that differ from the
//!   item. Author and year are never pushed, because the library holds a
//!   structured creator list and a free-form date where the note holds flat
//!   strings.
//! - External metadata → library: `remote_backfill` fills blank item fields.

use std::collections::BTreeSet;
use std::path::PathBuf;

use literature_notes::render::BASE_TAGS;
use literature_notes::{normalize_tag, Biblio, CitationField, Note};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::fs::atomic_write;
use crate::index::NoteIndex;
use crate::library::{Creator, FieldUpdate, Item, ItemData, RemoteField};
use crate::watcher::NoteWatcher;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to locate note: {0}")]
    Index(#[source] std::io::Error),

    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Citation fields pushed back to the library, with their item field.
const PUSHED_FIELDS: [(CitationField, RemoteField); 9] = [
    (CitationField::Journal, RemoteField::PublicationTitle),
    (CitationField::Publisher, RemoteField::Publisher),
    (CitationField::Volume, RemoteField::Volume),
    (CitationField::Issue, RemoteField::Issue),
    (CitationField::Pages, RemoteField::Pages),
    (CitationField::Doi, RemoteField::Doi),
    (CitationField::Issn, RemoteField::Issn),
    (CitationField::Url, RemoteField::Url),
    (CitationField::Language, RemoteField::Language),
];

/// What a note merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteFill {
    pub citation: Vec<CitationField>,
    /// Header keys filled, e.g. `doi`.
    pub header: Vec<&'static str>,
}

impl NoteFill {
    pub fn is_empty(&self) -> bool {
        self.citation.is_empty() && self.header.is_empty()
    }

    pub fn describe(&self) -> String {
        self.citation
            .iter()
            .map(|f| f.label())
            .chain(self.header.iter().copied())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Fill blank citation lines (and a blank `doi:` header entry) from `biblio`.
///
/// The header DOI mirrors the citation DOI when the note already has one.
pub fn fill_blank_note_fields(note: &mut Note, biblio: &Biblio) -> NoteFill {
    let mut fill = NoteFill::default();
    for field in CitationField::BIBLIOGRAPHIC {
        if note.fill_citation(field, &biblio.get(field)) {
            fill.citation.push(field);
        }
    }
    if note.header_value("doi") == Some("") {
        let doi = note
            .citation_value(CitationField::Doi)
            .map(str::to_string)
            .unwrap_or_else(|| biblio.doi.clone());
        if note.fill_header("doi", &doi) == Ok(true) {
            fill.header.push("doi");
        }
    }
    fill
}

/// Merge a known item's fields into its note.
///
/// Finds the note by item key, fills blank fields, and writes the note back
/// only if something changed. The write is registered with the watcher so it
/// is not mistaken for a human edit. Returns whether the note changed.
pub async fn merge_fields(
    item: &Item,
    index: &mut NoteIndex,
    watcher: &mut NoteWatcher,
) -> Result<bool, MergeError> {
    let Some(path) = index.locate(&item.key).await.map_err(MergeError::Index)? else {
        debug!("No note references item {}; nothing to merge", item.key);
        return Ok(false);
    };

    let content = fs::read_to_string(&path).await.map_err(|source| MergeError::Io {
        path: path.clone(),
        source,
    })?;
    let mut note = Note::parse(&content);
    if note.zotero_key() != Some(item.key.as_str()) {
        debug!("{} no longer references {}; skipping merge", path.display(), item.key);
        return Ok(false);
    }

    let fill = fill_blank_note_fields(&mut note, &item.data.biblio());
    if fill.is_empty() {
        return Ok(false);
    }

    atomic_write(&path, note.to_markdown().as_bytes())
        .await
        .map_err(|source| MergeError::Io {
            path: path.clone(),
            source,
        })?;
    watcher.mark_self_modified(&path).await;

    info!(
        "Filled {} in {} from item {}",
        fill.describe(),
        path.display(),
        item.key
    );
    Ok(true)
}

/// Tags a note adds on top of the base `literature`/`paper` tags, normalized.
fn topical_tags(note: &Note) -> Vec<String> {
    let mut seen = BTreeSet::new();
    note.tags()
        .into_iter()
        .map(|t| normalize_tag(&t))
        .filter(|t| !t.is_empty() && !BASE_TAGS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Note values that differ from the item, as an update.
pub fn push_diff(note: &Note, data: &ItemData) -> FieldUpdate {
    let mut update = FieldUpdate::default();

    for (field, remote) in PUSHED_FIELDS {
        let Some(local) = note.citation_value(field) else {
            continue;
        };
        let current = match remote {
            RemoteField::PublicationTitle => data.container_title(),
            other => data.get(other).trim(),
        };
        if local != current {
            update.set(remote, local);
        }
    }

    let local_tags = topical_tags(note);
    if !local_tags.is_empty() {
        let local_set: BTreeSet<&str> = local_tags.iter().map(String::as_str).collect();
        let remote_set: BTreeSet<String> = data
            .tags
            .iter()
            .map(|t| normalize_tag(&t.tag))
            .filter(|t| !t.is_empty())
            .collect();
        let remote_set: BTreeSet<&str> = remote_set.iter().map(String::as_str).collect();
        if local_set != remote_set {
            update.tags = Some(local_tags);
        }
    }

    update
}

/// Fill blank item fields from `values`. Populated item fields are kept.
pub fn remote_backfill(data: &ItemData, values: &Biblio) -> FieldUpdate {
    let mut update = FieldUpdate::default();

    if data.container_title().is_empty() && !values.journal.trim().is_empty() {
        update.set(RemoteField::PublicationTitle, values.journal.trim());
    }
    let scalar = [
        (RemoteField::Publisher, &values.publisher),
        (RemoteField::Volume, &values.volume),
        (RemoteField::Issue, &values.issue),
        (RemoteField::Pages, &values.pages),
        (RemoteField::Doi, &values.doi),
        (RemoteField::Issn, &values.issn),
        (RemoteField::Url, &values.url),
        (RemoteField::Language, &values.language),
        (RemoteField::Date, &values.year),
        (RemoteField::AbstractNote, &values.abstract_note),
    ];
    for (field, value) in scalar {
        if data.get(field).trim().is_empty() && !value.trim().is_empty() {
            update.set(field, value.trim());
        }
    }

    if data.authors().is_empty() {
        let creators = parse_author_string(&values.author);
        if !creators.is_empty() {
            let mut all = data.creators.clone();
            all.extend(creators);
            update.creators = Some(all);
        }
    }

    update
}

/// Split on commas that start a new name, e.g. `Jane Doe, John Smith`.
fn split_name_list(s: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (idx, ch) in s.char_indices() {
        if ch != ',' {
            continue;
        }
        let next = s[idx + 1..].trim_start().chars().next();
        if next.is_some_and(|c| c.is_uppercase() || (c.is_alphabetic() && !c.is_ascii())) {
            segments.push(&s[start..idx]);
            start = idx + 1;
        }
    }
    segments.push(&s[start..]);
    segments
}

/// Parse a flat author string into creators.
///
/// Accepts `Last, First; Last, First`, `First Last, First Last`, and a
/// single `Last, First`. Names that cannot be split become single-field
/// creators.
pub fn parse_author_string(authors: &str) -> Vec<Creator> {
    let authors = authors.trim();
    if authors.is_empty() || authors == "-" {
        return Vec::new();
    }

    let single = |name: &str| Creator {
        creator_type: "author".to_string(),
        name: name.to_string(),
        ..Default::default()
    };

    if authors.contains(';') {
        return authors
            .split(';')
            .map(|seg| seg.trim().trim_end_matches(',').trim())
            .filter(|seg| !seg.is_empty())
            .map(|seg| match seg.split_once(',') {
                Some((last, first)) if !last.trim().is_empty() => {
                    Creator::author(last.trim(), first.trim())
                }
                _ => single(seg),
            })
            .collect();
    }

    let segments = split_name_list(authors);
    let ascii = authors.is_ascii();
    if ascii
        && segments.len() == 2
        && segments[0].split_whitespace().count() == 1
        && segments[1].split_whitespace().count() <= 2
    {
        return vec![Creator::author(segments[0].trim(), segments[1].trim())];
    }

    segments
        .into_iter()
        .map(|seg| seg.trim().trim_end_matches([',', ';']).trim())
        .filter(|seg| !seg.is_empty())
        .map(single)
        .collect()
}
