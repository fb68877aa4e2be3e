//! Remove library items that duplicate a note-backed item by title.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use literature_notes::normalize_title;
use tracing::{info, warn};

use super::{all_items, load_notes, RepairError, RepairReport};
use crate::library::{Item, Library};

/// Items without a note whose title matches an item that has one.
pub fn find_duplicates<'a>(items: &'a [Item], note_keys: &BTreeSet<String>) -> Vec<&'a Item> {
    let mut by_title: BTreeMap<String, Vec<&Item>> = BTreeMap::new();
    for item in items {
        let fingerprint = normalize_title(&item.data.title);
        if !fingerprint.is_empty() {
            by_title.entry(fingerprint).or_default().push(item);
        }
    }

    by_title
        .into_values()
        .filter(|group| group.iter().any(|i| note_keys.contains(&i.key)))
        .flat_map(|group| group.into_iter().filter(|i| !note_keys.contains(&i.key)))
        .collect()
}

/// Report duplicates of note-backed items; delete them when `apply` is set.
pub async fn dedupe<L>(
    library: &L,
    notes_dir: &Path,
    apply: bool,
    delay: Duration,
) -> Result<RepairReport, RepairError>
where
    L: Library + ?Sized,
{
    let note_keys: BTreeSet<String> = load_notes(notes_dir)
        .await?
        .iter()
        .filter_map(|(_, note)| note.zotero_key().map(str::to_string))
        .collect();
    let items = all_items(library).await?;
    let duplicates = find_duplicates(&items, &note_keys);

    let mut report = RepairReport {
        examined: items.len(),
        ..Default::default()
    };
    info!("{} duplicate item(s) of note-backed items", duplicates.len());

    for (n, item) in duplicates.iter().enumerate() {
        if !apply {
            info!("Would delete {} \"{}\"", item.key, item.data.title);
            report.changed += 1;
            continue;
        }
        if n > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match library.delete_item(&item.key, item.version).await {
            Ok(()) => {
                info!("Deleted {} \"{}\"", item.key, item.data.title);
                report.changed += 1;
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", item.key, e);
                report.failed += 1;
            }
        }
    }

    report.log("Dedupe", !apply);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{InMemoryLibrary, ItemData};
    use tempfile::TempDir;

    fn article(key: &str, title: &str) -> ItemData {
        ItemData {
            key: key.into(),
            item_type: "journalArticle".into(),
            title: title.into(),
            ..Default::default()
        }
    }

    fn library() -> InMemoryLibrary {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "Deep Learning for X"));
        lib.insert(article("K2", "Deep  learning for <i>X</i>"));
        lib.insert(article("K3", "Unrelated"));
        lib.insert(article("K4", "Unrelated"));
        lib
    }

    fn notes_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("@2023_Deep-Learning-for-X.md"),
            "---\ntitle: \"Deep Learning for X\"\nzotero_key: K1\n---\n",
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_dedupe_reports_without_apply() {
        let lib = library();
        let dir = notes_dir();

        let report = dedupe(&lib, dir.path(), false, Duration::ZERO).await.unwrap();
        assert_eq!(report.examined, 4);
        assert_eq!(report.changed, 1);
        assert_eq!(lib.len(), 4);
    }

    #[tokio::test]
    async fn test_dedupe_apply_deletes_only_unbacked_copy() {
        let lib = library();
        let dir = notes_dir();

        let report = dedupe(&lib, dir.path(), true, Duration::ZERO).await.unwrap();
        assert_eq!(report.changed, 1);
        assert!(lib.get("K1").is_some());
        assert!(lib.get("K2").is_none());
        // Same-title items without any note are left alone.
        assert!(lib.get("K3").is_some());
        assert!(lib.get("K4").is_some());
    }
}
