//! Extracted PDF text and the append-only extraction cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::fs::atomic_write;
use crate::library::{Library, LibraryError};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable PDF {file}: {reason}")]
    Parse { file: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache is never overwritten when it cannot be read back.
    #[error("malformed extraction cache {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Document information dictionary of a PDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfMetadata {
    pub title: String,
    pub author: String,
    pub subject: String,
    pub creator: String,
    pub producer: String,
    pub creation_date: String,
    pub mod_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub file_name: String,
    #[serde(default)]
    pub file_size_kb: f64,
    #[serde(default)]
    pub metadata: PdfMetadata,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub full_text: String,
}

impl ExtractedDocument {
    /// Stand-in used when no readable PDF is available.
    pub fn placeholder(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn has_text(&self) -> bool {
        !self.full_text.trim().is_empty()
    }
}

/// PDF text extraction.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError>;
}

/// Extracted documents keyed by file name, persisted as a JSON array.
///
/// Entries are only ever appended; an existing file name is never extracted
/// or written again.
#[derive(Debug)]
pub struct ExtractionCache {
    path: PathBuf,
    entries: Vec<ExtractedDocument>,
    by_name: HashMap<String, usize>,
}

impl ExtractionCache {
    /// Open the cache. A missing file is an empty cache; a malformed one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries: Vec<ExtractedDocument> = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                CacheError::Malformed {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, doc)| (doc.file_name.clone(), i))
            .collect();
        debug!("Loaded {} cached extraction(s) from {:?}", entries.len(), path);
        Ok(Self {
            path,
            entries,
            by_name,
        })
    }

    pub fn get(&self, file_name: &str) -> Option<&ExtractedDocument> {
        self.by_name.get(file_name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.by_name.contains_key(file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtractedDocument> {
        self.entries.iter()
    }

    /// Append a document and rewrite the file. Returns `false` if the name was already cached.
    pub async fn append(&mut self, doc: ExtractedDocument) -> Result<bool, CacheError> {
        if self.contains(&doc.file_name) {
            return Ok(false);
        }
        self.by_name.insert(doc.file_name.clone(), self.entries.len());
        self.entries.push(doc);

        let json = serde_json::to_string_pretty(&self.entries).map_err(|source| {
            CacheError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        atomic_write(&self.path, json.as_bytes())
            .await
            .map_err(|source| CacheError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(true)
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

async fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut pdfs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_pdf(&path) && entry.file_type().await?.is_file() {
            pdfs.push(path);
        }
    }
    pdfs.sort();
    Ok(pdfs)
}

/// Extract every PDF in `dir` that is not cached yet. Returns the new documents.
///
/// A PDF that fails to extract is logged and skipped; it is tried again on the next run.
pub async fn ingest_folder(
    dir: &Path,
    extractor: &dyn Extractor,
    cache: &mut ExtractionCache,
) -> Result<Vec<ExtractedDocument>, CacheError> {
    let pdfs = list_pdfs(dir).await.map_err(|source| CacheError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut added = Vec::new();
    for pdf in pdfs {
        let name = pdf
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if cache.contains(&name) {
            continue;
        }
        info!("Extracting {}", name);
        match extractor.extract(&pdf) {
            Ok(doc) => {
                cache.append(doc.clone()).await?;
                added.push(doc);
            }
            Err(e) => warn!("Failed to extract {}: {}", name, e),
        }
    }

    info!("Extracted {} new PDF(s); {} cached in total", added.len(), cache.len());
    Ok(added)
}

/// Local path of an item's PDF attachment: `{storage}/{attachment key}/*.pdf`.
pub async fn locate_attachment<L>(
    library: &L,
    item_key: &str,
    storage_dir: &Path,
) -> Result<Option<PathBuf>, LibraryError>
where
    L: Library + ?Sized,
{
    let children = library.children(item_key).await?;
    for child in children {
        if child.data.item_type != "attachment" || child.data.content_type != "application/pdf" {
            continue;
        }
        let dir = storage_dir.join(&child.key);
        if let Some(name) = child.data.extra.get("filename").and_then(|v| v.as_str()) {
            let candidate = dir.join(name);
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(Some(candidate));
            }
        }
        match list_pdfs(&dir).await {
            Ok(pdfs) => {
                if let Some(first) = pdfs.into_iter().next() {
                    return Ok(Some(first));
                }
            }
            Err(e) => debug!("Cannot list {}: {}", dir.display(), e),
        }
    }
    Ok(None)
}
