//! Manual mode: notes straight from a folder of PDFs, without the library.

use std::path::Path;

use tracing::{info, warn};

use super::{RepairError, RepairReport};
use crate::analysis::{Analyzer, LlmBackend};
use crate::breaker::CircuitBreaker;
use crate::extraction::{ingest_folder, ExtractedDocument, ExtractionCache, Extractor};
use crate::pipeline::{generate_note, today};
use crate::topics::TopicHubs;

/// Extract new PDFs from `pdf_dir` and write a note for each.
///
/// With `all` every cached document is analyzed again; notes that already
/// exist are skipped by [`generate_note`].
pub async fn ingest<B>(
    pdf_dir: &Path,
    extractor: &dyn Extractor,
    cache: &mut ExtractionCache,
    analyzer: &Analyzer<B>,
    hubs: &TopicHubs,
    notes_dir: &Path,
    all: bool,
) -> Result<RepairReport, RepairError>
where
    B: LlmBackend,
{
    let new_docs = ingest_folder(pdf_dir, extractor, cache).await?;
    let docs: Vec<ExtractedDocument> = if all {
        cache.iter().cloned().collect()
    } else {
        new_docs
    };

    let mut report = RepairReport {
        examined: docs.len(),
        ..Default::default()
    };
    let mut breaker = CircuitBreaker::new();
    let created = today();

    for (n, doc) in docs.iter().enumerate() {
        info!("[{}/{}] Analyzing {}", n + 1, docs.len(), doc.file_name);
        let analysis = match analyzer.analyze(doc, None, hubs, &mut breaker).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Analysis of {} failed: {}", doc.file_name, e);
                report.failed += 1;
                continue;
            }
        };
        match generate_note(notes_dir, hubs, &analysis, &doc.file_name, "", &created).await? {
            Some(_) => report.changed += 1,
            None => report.skipped += 1,
        }
    }

    report.log("Ingest", false);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LlmError;
    use crate::extraction::{ExtractError, PdfMetadata};
    use async_trait::async_trait;
    use literature_notes::Note;
    use tempfile::TempDir;

    struct Unavailable;

    #[async_trait]
    impl LlmBackend for Unavailable {
        async fn generate(&self, model: &str, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError::Permanent(format!("{model} not found")))
        }
    }

    struct StubExtractor;

    impl Extractor for StubExtractor {
        fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(ExtractedDocument {
                file_name: name,
                file_size_kb: 1.0,
                metadata: PdfMetadata {
                    title: "Sparse Attention".into(),
                    creation_date: "D:20210304".into(),
                    ..Default::default()
                },
                page_count: 8,
                full_text: "Abstract: We study sparse attention.\n\nIntroduction".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_ingest_writes_keyless_note_once() {
        let pdfs = TempDir::new().unwrap();
        let notes = TempDir::new().unwrap();
        std::fs::write(pdfs.path().join("sparse.pdf"), b"%PDF").unwrap();
        let mut cache = ExtractionCache::open(pdfs.path().join("cache.json")).await.unwrap();
        let analyzer = Analyzer::new(Unavailable, "big", "small");
        let hubs = TopicHubs::new(notes.path());

        let report = ingest(pdfs.path(), &StubExtractor, &mut cache, &analyzer, &hubs, notes.path(), false)
            .await
            .unwrap();
        assert_eq!(report.changed, 1);

        let path = notes.path().join("@2021_Sparse-Attention.md");
        let note = Note::parse(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(note.title().as_deref(), Some("Sparse Attention"));
        assert_eq!(note.zotero_key(), None);

        // Nothing new to extract.
        let again = ingest(pdfs.path(), &StubExtractor, &mut cache, &analyzer, &hubs, notes.path(), false)
            .await
            .unwrap();
        assert_eq!(again.examined, 0);

        // Re-analyzing the cache finds the note in place.
        let all = ingest(pdfs.path(), &StubExtractor, &mut cache, &analyzer, &hubs, notes.path(), true)
            .await
            .unwrap();
        assert_eq!(all.examined, 1);
        assert_eq!(all.skipped, 1);
    }
}
