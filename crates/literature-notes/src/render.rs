//! Rendering of newly generated literature notes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::citation::{Biblio, CitationField};
use crate::fingerprint::normalize_tag;

static FORBIDDEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\n\r\t]"#).expect("valid regex"));
static HYPHEN_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("valid regex"));
static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s").expect("valid regex"));

/// Tags every generated note carries.
pub const BASE_TAGS: [&str; 2] = ["literature", "paper"];

const MAX_TITLE_CHARS: usize = 80;
const SIMILAR_PREFIX_CHARS: usize = 30;

/// Section content as returned by analysis: either prose or a list of points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionText {
    Text(String),
    Items(Vec<String>),
}

impl Default for SectionText {
    fn default() -> Self {
        SectionText::Text(String::new())
    }
}

impl SectionText {
    pub fn is_empty(&self) -> bool {
        match self {
            SectionText::Text(s) => s.trim().is_empty(),
            SectionText::Items(items) => items.iter().all(|i| i.trim().is_empty()),
        }
    }

    pub fn to_bullets(&self) -> String {
        match self {
            SectionText::Text(s) => s.clone(),
            SectionText::Items(items) => items
                .iter()
                .filter(|i| !i.is_empty())
                .map(|i| format!("- {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Numbered list; items that already carry a number keep it.
    pub fn to_numbered(&self) -> String {
        match self {
            SectionText::Text(s) => s.clone(),
            SectionText::Items(items) => items
                .iter()
                .enumerate()
                .filter(|(_, i)| !i.is_empty())
                .map(|(n, i)| {
                    if NUMBERED.is_match(i) {
                        i.clone()
                    } else {
                        format!("{}. {i}", n + 1)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn to_excerpts(&self) -> String {
        match self {
            SectionText::Text(s) => s.trim().to_string(),
            SectionText::Items(_) => self.to_bullets(),
        }
    }
}

/// Everything needed to render a new note.
#[derive(Debug, Clone, Default)]
pub struct NoteDraft {
    pub biblio: Biblio,
    /// ISO date the note was generated.
    pub created: String,
    pub zotero_key: String,
    pub abstract_text: String,
    pub key_claims: SectionText,
    pub method: String,
    pub findings: SectionText,
    pub excerpts: SectionText,
    /// Topic hub names, e.g. `MOC_Machine-Learning`.
    pub topics: Vec<String>,
    pub source_file: String,
}

/// Replace characters that are not allowed in file names.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced = FORBIDDEN_CHARS.replace_all(name.trim(), "-").replace(' ', "-");
    let collapsed = HYPHEN_RUN.replace_all(&replaced, "-");
    collapsed.trim_matches('-').to_string()
}

/// `@{year}_{title}.md`, with the title sanitized and cut near 80 characters.
pub fn build_filename(year: &str, title: &str) -> String {
    let title = if title.trim().is_empty() { "Untitled" } else { title };
    let mut safe = sanitize_file_name(title);
    if safe.chars().count() > MAX_TITLE_CHARS {
        let cut: String = safe.chars().take(MAX_TITLE_CHARS).collect();
        safe = match cut.rsplit_once('-') {
            Some((head, _)) => head.to_string(),
            None => cut,
        };
    }
    format!("@{}_{}.md", year.trim(), safe)
}

/// Lowercased title prefix used to spot an existing note for the same paper.
pub fn title_stem(title: &str) -> String {
    sanitize_file_name(title)
        .chars()
        .take(SIMILAR_PREFIX_CHARS)
        .collect::<String>()
        .to_lowercase()
}

/// Header tag list: base tags first, then normalized extras without repeats.
pub fn format_header_tags(tags: &[String]) -> String {
    let mut all: Vec<String> = BASE_TAGS.iter().map(|t| t.to_string()).collect();
    for tag in tags.iter().map(|t| normalize_tag(t)).filter(|t| !t.is_empty()) {
        if !all.contains(&tag) {
            all.push(tag);
        }
    }
    all.join(", ")
}

pub fn format_hashtags(tags: &[String]) -> String {
    tags.iter()
        .map(|t| normalize_tag(t))
        .filter(|t| !t.is_empty())
        .map(|t| format!("#{t}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `[[MOC_A]] | [[MOC_B]]`
pub fn format_topic_links(topics: &[String]) -> String {
    topics
        .iter()
        .map(|t| format!("[[{t}]]"))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn yaml_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Source PDF name with the extension normalized to lowercase `.pdf`.
fn pdf_name(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case("pdf") => stem,
        _ => file_name,
    };
    format!("{stem}.pdf")
}

/// Render a complete note. Unknown citation values render as blank lines so
/// they can be backfilled later.
pub fn render_note(draft: &NoteDraft) -> String {
    let b = &draft.biblio;
    let mut out = String::new();

    out.push_str("---\n");
    out.push_str(&format!("title: {}\n", yaml_quote(&b.title)));
    out.push_str(&format!("year: {}\n", b.year));
    out.push_str(&format!("tags: [{}]\n", format_header_tags(&b.tags)));
    out.push_str(&format!("created: {}\n", draft.created));
    out.push_str(&format!("zotero_key: {}\n", draft.zotero_key));
    out.push_str(&format!("doi: {}\n", b.doi));
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", b.title));

    out.push_str("## Citation\n");
    for field in CitationField::ALL {
        out.push_str(&format!("- **{}**: {}\n", field.label(), b.get(field)));
    }

    let sections = [
        ("Abstract", draft.abstract_text.clone()),
        ("Key Claims", draft.key_claims.to_bullets()),
        ("Method", draft.method.clone()),
        ("Findings", draft.findings.to_numbered()),
        ("Excerpts", draft.excerpts.to_excerpts()),
    ];
    for (heading, text) in sections {
        out.push_str(&format!("\n## {heading}\n{text}\n"));
    }

    out.push_str("\n## My Thoughts\n> [Personal thoughts, critique, open questions]\n\n-\n");

    out.push_str("\n## Links\n- Related notes:\n");
    out.push_str(&format!("- MOC: {}\n", format_topic_links(&draft.topics)));

    out.push_str(&format!(
        "\n---\n**Source file**: [[{}]]\n",
        pdf_name(&draft.source_file)
    ));
    out
}
