//! Bring notes written with an older template up to the current field layout.

use std::path::Path;

use tracing::{debug, info};

use super::{load_notes, RepairError, RepairReport};
use crate::fs::atomic_write;

/// Add a `doi:` header key and every missing Citation line, blank.
///
/// Existing values are never touched. Notes without a header or a Citation
/// section are skipped.
pub async fn migrate_fields(notes_dir: &Path, dry_run: bool) -> Result<RepairReport, RepairError> {
    let mut report = RepairReport::default();

    for (path, mut note) in load_notes(notes_dir).await? {
        report.examined += 1;
        if !note.has_header() || !note.has_citation_section() {
            debug!("Skipping {}: not in the literature note layout", path.display());
            report.skipped += 1;
            continue;
        }

        let header_added = note.ensure_header_key("doi").unwrap_or(false);
        let lines_added = note.ensure_citation_fields().unwrap_or_default();
        if !header_added && lines_added.is_empty() {
            continue;
        }

        let mut added: Vec<&str> = lines_added.iter().map(|f| f.label()).collect();
        if header_added {
            added.insert(0, "doi header");
        }
        if dry_run {
            info!("Would add {} to {}", added.join(", "), path.display());
        } else {
            atomic_write(&path, note.to_markdown().as_bytes())
                .await
                .map_err(|source| RepairError::Io {
                    path: path.clone(),
                    source,
                })?;
            debug!("Added {} to {}", added.join(", "), path.display());
        }
        report.changed += 1;
    }

    report.log("Field migration", dry_run);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const OLD: &str = "---\ntitle: \"Old\"\ncreated: 2022-03-01\n---\n\n## Citation\n\
                       - **Author**: Doe, J\n- **Year**: 2020\n- **Journal**: J. Old\n\
                       - **DOI**: 10.1/old\n- **Tags**: #nlp\n\n## Abstract\nText\n";

    #[tokio::test]
    async fn test_migrate_adds_missing_fields_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_Old.md");
        std::fs::write(&path, OLD).unwrap();
        std::fs::write(dir.path().join("@2020_Plain.md"), "Just some text\n").unwrap();

        let report = migrate_fields(dir.path(), false).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "---\ntitle: \"Old\"\ncreated: 2022-03-01\ndoi:\n---\n\n## Citation\n\
             - **Author**: Doe, J\n- **Year**: 2020\n- **Journal**: J. Old\n- **Publisher**:\n\
             - **Volume**:\n- **Issue**:\n- **Pages**:\n- **DOI**: 10.1/old\n- **ISSN**:\n\
             - **URL**:\n- **Language**:\n- **Tags**: #nlp\n\n## Abstract\nText\n"
        );

        let again = migrate_fields(dir.path(), false).await.unwrap();
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn test_migrate_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("@2020_Old.md");
        std::fs::write(&path, OLD).unwrap();

        let report = migrate_fields(dir.path(), true).await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), OLD);
    }
}
