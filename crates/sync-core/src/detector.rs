//! Remote change detection and classification.

use std::collections::HashSet;

use literature_notes::normalize_title;
use tracing::{debug, info, warn};

use crate::library::{Item, Library, LibraryError};
use crate::state::ProcessingState;

/// Items observed in one poll, by what should happen to them.
#[derive(Debug, Default)]
pub struct Classification {
    /// Never processed; each becomes a note.
    pub new_items: Vec<Item>,
    /// Already have a note; routed to the field merge.
    pub already_known: Vec<Item>,
    /// Same normalized title as a processed item. Their keys were registered
    /// as processed and they are not turned into notes.
    pub duplicates: Vec<Item>,
    /// Share a title with an earlier new item in this same batch. Held back
    /// until that item is done, then classified again.
    pub deferred: Vec<Item>,
    /// Attachments, notes and theses.
    pub excluded: usize,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.new_items.is_empty()
            && self.already_known.is_empty()
            && self.duplicates.is_empty()
            && self.deferred.is_empty()
    }
}

/// Poll the library for items changed since the last cycle and classify them.
///
/// The version marker is read before the item fetch so that anything
/// modified in between is picked up again next time. If the item fetch fails
/// the state is left untouched and an empty classification is returned; the
/// next poll starts from the same version.
///
/// Keys in `state.retry_keys` are fetched individually and classified along
/// with the batch, so interrupted or failed items are not lost once the
/// version marker moves past them.
pub async fn get_new_items<L>(library: &L, state: &mut ProcessingState) -> Classification
where
    L: Library + ?Sized,
{
    let marker = match library.library_version().await {
        Ok(version) => Some(version),
        Err(e) => {
            warn!("Failed to read library version: {}", e);
            None
        }
    };

    let mut candidates = match library.items_since(state.last_version).await {
        Ok(items) => items,
        Err(e) => {
            warn!("Failed to fetch items since version {}: {}", state.last_version, e);
            return Classification::default();
        }
    };
    debug!(
        "Fetched {} changed item(s) since version {}",
        candidates.len(),
        state.last_version
    );

    if let Some(version) = marker {
        state.last_version = state.last_version.max(version);
    }

    let in_batch: HashSet<String> = candidates.iter().map(|i| i.key.clone()).collect();
    let pending: Vec<String> = state
        .retry_keys
        .iter()
        .filter(|k| !in_batch.contains(*k))
        .cloned()
        .collect();
    for key in pending {
        match library.item(&key).await {
            Ok(item) => candidates.push(item),
            Err(LibraryError::NotFound(_)) => {
                info!("Retry item {} no longer exists remotely; dropping", key);
                state.retry_keys.remove(&key);
            }
            Err(e) => warn!("Failed to fetch retry item {}: {}", key, e),
        }
    }

    classify(candidates, state)
}

fn classify(candidates: Vec<Item>, state: &mut ProcessingState) -> Classification {
    let mut result = Classification::default();
    let mut batch_titles: HashSet<String> = HashSet::new();

    for item in candidates {
        if item.data.is_excluded_type() || item.data.parent_item.is_some() {
            state.retry_keys.remove(&item.key);
            result.excluded += 1;
            continue;
        }

        if state.is_processed(&item.key) {
            result.already_known.push(item);
            continue;
        }

        let title = normalize_title(&item.data.title);
        if state.has_title(&title) {
            info!(
                "Duplicate by title: {} \"{}\"; registering without a new note",
                item.key, item.data.title
            );
            state.mark_duplicate(&item.key);
            result.duplicates.push(item);
            continue;
        }

        if !title.is_empty() && !batch_titles.insert(title) {
            debug!("Deferring {}: same title as an earlier item in this batch", item.key);
            result.deferred.push(item);
            continue;
        }

        result.new_items.push(item);
    }

    result
}
