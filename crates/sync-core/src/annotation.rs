//! Analysis summaries attached to library items as child notes.

use literature_notes::SectionText;
use tracing::info;

use crate::analysis::Analysis;
use crate::library::{ItemData, Library, LibraryError, Tag};

/// Tag carried by every generated child note.
pub const ANNOTATION_TAG: &str = "auto-analyzed";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn list_html(section: &SectionText) -> String {
    match section {
        SectionText::Items(items) => {
            let items: String = items
                .iter()
                .filter(|i| !i.trim().is_empty())
                .map(|i| format!("<li>{}</li>", escape(i)))
                .collect();
            format!("<ul>{items}</ul>")
        }
        SectionText::Text(text) if text.trim().is_empty() => String::new(),
        SectionText::Text(text) => format!("<p>{}</p>", escape(text)),
    }
}

/// Blank-line separated blocks become paragraphs, single newlines `<br>`.
fn text_html(section: &SectionText) -> String {
    match section {
        SectionText::Items(items) => {
            let items: String = items
                .iter()
                .filter(|i| !i.trim().is_empty())
                .map(|i| format!("<li>{}</li>", escape(i)))
                .collect();
            if items.is_empty() {
                String::new()
            } else {
                format!("<ul>{items}</ul>")
            }
        }
        SectionText::Text(text) => text
            .split("\n\n")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(|b| format!("<p>{}</p>", escape(b).replace('\n', "<br>")))
            .collect(),
    }
}

/// HTML body of the child note for an analysis.
pub fn note_html(analysis: &Analysis) -> String {
    format!(
        "<h2>Key Claims</h2>{}<h2>Method</h2><p>{}</p><h2>Findings</h2>{}<h2>Excerpts</h2>{}",
        list_html(&analysis.key_claims),
        escape(&analysis.method),
        list_html(&analysis.findings),
        text_html(&analysis.excerpts),
    )
}

pub fn annotation_item(parent_key: &str, analysis: &Analysis) -> ItemData {
    ItemData {
        item_type: "note".to_string(),
        parent_item: Some(parent_key.to_string()),
        note: note_html(analysis),
        tags: vec![Tag::new(ANNOTATION_TAG)],
        ..Default::default()
    }
}

/// Create the child note under `parent_key`. Returns the new note's key.
pub async fn post_annotation<L>(
    library: &L,
    parent_key: &str,
    analysis: &Analysis,
) -> Result<String, LibraryError>
where
    L: Library + ?Sized,
{
    let result = library
        .create_items(&[annotation_item(parent_key, analysis)])
        .await?;
    if let Some(reason) = result.failed.get(&0) {
        return Err(LibraryError::Malformed(format!(
            "note for {parent_key} rejected: {reason}"
        )));
    }
    let key = result.created.get(&0).cloned().ok_or_else(|| {
        LibraryError::Malformed(format!("no key returned for the note of {parent_key}"))
    })?;
    info!("Attached analysis note {} to item {}", key, parent_key);
    Ok(key)
}
