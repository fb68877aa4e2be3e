//! Bring the excerpts section of existing notes to the structured layout.
//!
//! [`regenerate_excerpts`] asks the full model for a new section;
//! [`restructure_excerpts`] rearranges what the note already says, offline.

use std::path::Path;

use literature_notes::Note;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::import::biblio_from_note;
use super::{linked_document, load_notes, RepairError, RepairReport};
use crate::analysis::{
    is_placeholder_text, Analyzer, ExcerptSource, LlmBackend, EXCERPT_HEADING,
    FALLBACK_EXCERPT_THEME,
};
use crate::breaker::CircuitBreaker;
use crate::extraction::ExtractionCache;
use crate::fs::atomic_write;

const EXCERPTS: &str = "Excerpts";
const SUMMARY_HEADING: &str = "### **Executive summary**";

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*]\s*|\d+[.)]\s*)").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct ExcerptOptions {
    pub dry_run: bool,
    /// Stop after this many notes; `None` means all of them.
    pub limit: Option<usize>,
}

/// Excerpts that are unstructured or still the text-extraction fallback.
pub fn needs_new_excerpts(note: &Note) -> bool {
    note.section(EXCERPTS)
        .is_some_and(|s| !s.contains(EXCERPT_HEADING) || s.contains(FALLBACK_EXCERPT_THEME))
}

fn excerpt_source(note: &Note, cache: Option<&ExtractionCache>) -> ExcerptSource {
    let section = |name| note.section(name).unwrap_or_default();
    let full_text = cache
        .and_then(|c| linked_document(&note.to_markdown(), c))
        .map(|doc| doc.full_text.clone())
        .unwrap_or_default();
    ExcerptSource {
        biblio: biblio_from_note(note),
        abstract_text: section("Abstract"),
        key_claims: section("Key Claims"),
        method: section("Method"),
        findings: section("Findings"),
        full_text,
    }
}

/// Rewrite the excerpts of every note that [`needs_new_excerpts`] with the
/// full model. Notes with neither usable sections nor cached text are skipped.
pub async fn regenerate_excerpts<B>(
    notes_dir: &Path,
    cache: Option<&ExtractionCache>,
    analyzer: &Analyzer<B>,
    options: ExcerptOptions,
) -> Result<RepairReport, RepairError>
where
    B: LlmBackend,
{
    let mut report = RepairReport::default();
    let mut breaker = CircuitBreaker::new();

    let mut targets = Vec::new();
    for (path, note) in load_notes(notes_dir).await? {
        if !needs_new_excerpts(&note) {
            continue;
        }
        let source = excerpt_source(&note, cache);
        if source.is_empty() {
            debug!("Nothing to base excerpts on for {}", path.display());
            report.skipped += 1;
            continue;
        }
        targets.push((path, note, source));
    }
    if let Some(limit) = options.limit {
        targets.truncate(limit);
    }
    report.examined = targets.len();
    info!("{} note(s) need new excerpts", targets.len());

    for (n, (path, mut note, source)) in targets.into_iter().enumerate() {
        info!("[{}/{}] Regenerating excerpts of {}", n + 1, report.examined, path.display());
        if options.dry_run {
            report.changed += 1;
            continue;
        }
        let excerpts = match analyzer.regenerate_excerpts(&source, &mut breaker).await {
            Ok(Some(excerpts)) => excerpts,
            Ok(None) => {
                report.failed += 1;
                continue;
            }
            Err(e) if e.is_rate_limited() => {
                warn!("Rate limited; stopping after {} note(s)", n);
                report.failed += 1;
                break;
            }
            Err(e) => {
                warn!("Excerpts for {} failed: {}", path.display(), e);
                report.failed += 1;
                continue;
            }
        };
        if !note.replace_section(EXCERPTS, &excerpts)? {
            report.skipped += 1;
            continue;
        }
        atomic_write(&path, note.to_markdown().as_bytes())
            .await
            .map_err(|source| RepairError::Io {
                path: path.clone(),
                source,
            })?;
        report.changed += 1;
    }

    report.log("Regenerate excerpts", options.dry_run);
    Ok(report)
}

/// Up to `n` meaningful lines of a section, list markers removed.
fn leading_lines(section: &str, n: usize) -> Vec<String> {
    section
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_placeholder_text(line))
        .map(|line| LIST_MARKER.replace(line, "").trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty() && line != "\u{2014}")
        .take(n)
        .collect()
}

/// The structured layout built from a note's own sections.
fn structured_excerpts(note: &Note) -> String {
    let section = |name| note.section(name).unwrap_or_default();

    let mut claims = leading_lines(&section("Key Claims"), 3);
    if claims.is_empty() {
        claims = leading_lines(&section(EXCERPTS), 3);
    }
    if claims.is_empty() {
        claims.push("Add excerpts based on the key claims.".to_string());
    }

    let mut evidence = Vec::new();
    if let Some(method) = leading_lines(&section("Method"), 1).pop() {
        evidence.push(format!("Method: {method}"));
    }
    evidence.extend(leading_lines(&section("Findings"), 2));
    if evidence.is_empty() {
        evidence.push("Complete from the method and findings sections.".to_string());
    }

    let mut summary = leading_lines(&section("Abstract"), 2).join(" ");
    if summary.is_empty() {
        summary = "Summarize the key claims and findings here.".to_string();
    }

    let bullets = |lines: &[String]| {
        lines
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "{EXCERPT_HEADING}\n\n#### **1. Excerpts from the key claims**\n{}\n\n\
         #### **2. Method and findings**\n{}\n\n{SUMMARY_HEADING}\n{summary}",
        bullets(&claims),
        bullets(&evidence),
    )
}

/// Rearrange unstructured excerpts into the structured layout without a model.
pub async fn restructure_excerpts(notes_dir: &Path, dry_run: bool) -> Result<RepairReport, RepairError> {
    let mut report = RepairReport::default();

    for (path, mut note) in load_notes(notes_dir).await? {
        let Some(current) = note.section(EXCERPTS) else {
            continue;
        };
        report.examined += 1;
        if current.contains(EXCERPT_HEADING) && current.contains(SUMMARY_HEADING) {
            report.skipped += 1;
            continue;
        }

        let excerpts = structured_excerpts(&note);
        if !note.replace_section(EXCERPTS, &excerpts)? {
            report.skipped += 1;
            continue;
        }
        report.changed += 1;
        if dry_run {
            info!("Would restructure excerpts of {}", path.display());
            continue;
        }
        atomic_write(&path, note.to_markdown().as_bytes())
            .await
            .map_err(|source| RepairError::Io {
                path: path.clone(),
                source,
            })?;
        info!("Restructured excerpts of {}", path.display());
    }

    report.log("Restructure excerpts", dry_run);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FLAT: &str = "---\ntitle: Sparse Attention\nyear: 2021\nzotero_key: K1\n---\n\n\
# Sparse Attention\n\n## Citation\n- **Author**: Kim\n\n\
## Abstract\nWe study sparse attention at scale. It halves memory use.\n\n\
## Key Claims\n- Sparse attention matches dense quality on long documents\n- Memory use drops by half\n\n\
## Method\n- Benchmarks on three corpora\n\n\
## Findings\n1. Half the memory\n2. Same perplexity\n\n\
## Excerpts\n- \"Attention need not be dense.\"\n\n\
## My Thoughts\n-\n\n---\n**Source file**: [[sparse.pdf]]\n";

    /// Replays scripted answers and records the models asked.
    struct Scripted {
        answers: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl Scripted {
        fn new(mut answers: Vec<Result<String, LlmError>>) -> Self {
            answers.reverse();
            Self {
                answers: Mutex::new(answers),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, LlmError> {
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LlmError::Transient("script exhausted".into())))
        }
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    // ==================== selection tests ====================

    #[test]
    fn test_needs_new_excerpts() {
        assert!(needs_new_excerpts(&Note::parse(FLAT)));
        let fallback = format!("## Excerpts\n{EXCERPT_HEADING}\n\n{FALLBACK_EXCERPT_THEME}\n- text\n");
        assert!(needs_new_excerpts(&Note::parse(&fallback)));
        let done = format!("## Excerpts\n{EXCERPT_HEADING}\n\n#### **1. Sparsity**\ntext\n");
        assert!(!needs_new_excerpts(&Note::parse(&done)));
        assert!(!needs_new_excerpts(&Note::parse("## Abstract\ntext\n")));
    }

    #[test]
    fn test_leading_lines_drop_markers_and_placeholders() {
        let lines = leading_lines("> [Summarize the key claims]\n\n-\n- First\n2. \"Second\"\n* Third\n- Fourth", 3);
        assert_eq!(lines, vec!["First", "Second", "Third"]);
    }

    // ==================== regeneration tests ====================

    #[tokio::test]
    async fn test_regenerate_replaces_only_excerpts() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "@2021_Sparse-Attention.md", FLAT);
        let answer = format!("```markdown\n{EXCERPT_HEADING}\n\n#### **1. Sparsity**\nDense is not needed.\n```");
        let analyzer = Analyzer::new(Scripted::new(vec![Ok(answer)]), "full", "lite");

        let report = regenerate_excerpts(dir.path(), None, &analyzer, ExcerptOptions::default())
            .await
            .unwrap();
        assert_eq!(report.changed, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let note = Note::parse(&content);
        assert_eq!(
            note.section("Excerpts").as_deref(),
            Some("### **Paper analysis**\n\n#### **1. Sparsity**\nDense is not needed.")
        );
        assert_eq!(note.section("Key Claims"), Note::parse(FLAT).section("Key Claims"));
        assert!(content.ends_with("**Source file**: [[sparse.pdf]]\n"));
        assert!(!needs_new_excerpts(&note));
    }

    #[tokio::test]
    async fn test_regenerate_keeps_note_on_bad_answer() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "@2021_Sparse-Attention.md", FLAT);
        let analyzer = Analyzer::new(Scripted::new(vec![Ok("Just prose.".into())]), "full", "lite");

        let report = regenerate_excerpts(dir.path(), None, &analyzer, ExcerptOptions::default())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FLAT);
    }

    #[tokio::test]
    async fn test_regenerate_stops_on_rate_limit() {
        let dir = TempDir::new().unwrap();
        write(&dir, "@2021_Sparse-Attention.md", FLAT);
        write(&dir, "@2021_Sparse-Attention-Two.md", FLAT);
        let analyzer = Analyzer::new(
            Scripted::new(vec![Err(LlmError::RateLimited("429".into()))]),
            "full",
            "lite",
        );

        let report = regenerate_excerpts(dir.path(), None, &analyzer, ExcerptOptions::default())
            .await
            .unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.changed, 0);
    }

    #[tokio::test]
    async fn test_regenerate_skips_notes_without_material() {
        let dir = TempDir::new().unwrap();
        write(&dir, "@2021_Empty.md", "# Empty\n\n## Abstract\n-\n\n## Excerpts\n- quote\n");
        let analyzer = Analyzer::new(Scripted::new(vec![]), "full", "lite");

        let report = regenerate_excerpts(dir.path(), None, &analyzer, ExcerptOptions::default())
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.skipped, 1);
    }

    // ==================== restructure tests ====================

    #[tokio::test]
    async fn test_restructure_builds_layout_from_sections() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "@2021_Sparse-Attention.md", FLAT);

        let dry = restructure_excerpts(dir.path(), true).await.unwrap();
        assert_eq!(dry.changed, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FLAT);

        let report = restructure_excerpts(dir.path(), false).await.unwrap();
        assert_eq!(report.changed, 1);
        let note = Note::parse(&std::fs::read_to_string(&path).unwrap());
        let excerpts = note.section("Excerpts").unwrap();
        assert!(excerpts.starts_with(EXCERPT_HEADING));
        assert!(excerpts.contains("- Sparse attention matches dense quality on long documents"));
        assert!(excerpts.contains("- Method: Benchmarks on three corpora"));
        assert!(excerpts.contains("- Same perplexity"));
        assert!(excerpts.ends_with(
            "### **Executive summary**\nWe study sparse attention at scale. It halves memory use."
        ));

        let again = restructure_excerpts(dir.path(), false).await.unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(again.skipped, 1);
    }

    #[test]
    fn test_structured_excerpts_fall_back_to_old_body() {
        let note = Note::parse("## Key Claims\n> [Summarize the key claims]\n\n-\n\n## Excerpts\n- \"A quote\"\n");
        let excerpts = structured_excerpts(&note);
        assert!(excerpts.contains("#### **1. Excerpts from the key claims**\n- A quote"));
        assert!(excerpts.contains("- Complete from the method and findings sections."));
        assert!(excerpts.ends_with("Summarize the key claims and findings here."));
    }
}
