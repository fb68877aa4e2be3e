//! File helpers shared by the state store, caches and note writers.

use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::fs;

/// Generate a random hex string for temp file names.
fn random_hex() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

/// Write via a temp file in the same directory followed by a rename, so
/// readers see either the old content or the new content, never a mix.
pub async fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, random_hex()));

    if let Err(e) = fs::write(&temp_path, content).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// Literature notes are named `@{year}_{title}.md`.
pub fn is_note_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('@') && n.ends_with(".md"))
}

/// All literature notes directly inside `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub async fn list_notes(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut notes = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_note_file(&path) && entry.file_type().await?.is_file() {
            notes.push(path);
        }
    }
    notes.sort();
    Ok(notes)
}
