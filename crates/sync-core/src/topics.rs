//! Topic hub notes (`MOC_*.md`) that literature notes link to.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::fs::atomic_write;

pub const HUB_PREFIX: &str = "MOC_";
const MAX_DESCRIPTION_CHARS: usize = 100;

/// Folder of topic hubs, scanned fresh on every call so hubs created
/// earlier in a batch are offered to later items.
#[derive(Debug, Clone)]
pub struct TopicHubs {
    dir: PathBuf,
}

impl TopicHubs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hub name to description (first body line that is not a heading or rule).
    pub async fn scan(&self) -> Result<BTreeMap<String, String>, std::io::Error> {
        let mut hubs = BTreeMap::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hubs),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let is_md = path.extension().and_then(|e| e.to_str()) == Some("md");
            if !is_md || !stem.starts_with(HUB_PREFIX) {
                continue;
            }
            let description = match fs::read_to_string(&path).await {
                Ok(content) => describe(&content),
                Err(e) => {
                    debug!("Cannot read hub {}: {}", path.display(), e);
                    String::new()
                }
            };
            hubs.insert(stem.to_string(), description);
        }
        Ok(hubs)
    }

    /// Hub list as offered to the analysis prompt.
    pub fn catalog_text(hubs: &BTreeMap<String, String>) -> String {
        if hubs.is_empty() {
            return "No topic hubs exist yet. Propose new hubs that fit the paper.".to_string();
        }
        hubs.iter()
            .map(|(name, desc)| {
                if desc.is_empty() {
                    format!("- {name}")
                } else {
                    format!("- {name}: {desc}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Create the hub if it does not exist. An existing hub is never rewritten.
    ///
    /// Returns the normalized hub name and whether a file was created.
    pub async fn ensure(
        &self,
        name: &str,
        description: &str,
    ) -> Result<(String, bool), std::io::Error> {
        let name = hub_name(name);
        let path = self.dir.join(format!("{name}.md"));
        if fs::try_exists(&path).await? {
            return Ok((name, false));
        }

        let topic = name.trim_start_matches(HUB_PREFIX);
        let description = if description.trim().is_empty() {
            format!("Research hub for {topic}.")
        } else {
            description.trim().to_string()
        };
        let content = format!(
            "# MOC: {topic}\n\n{description}\n\n---\n\n## Key concepts\n\n\
             - [Filled in as papers are processed]\n\n---\n\n## Research questions\n\n\
             1. [Add research questions]\n\n---\n\n#MOC #{topic}\n"
        );
        atomic_write(&path, content.as_bytes()).await?;
        info!("Created topic hub {}", name);
        Ok((name, true))
    }
}

/// `MOC_`-prefixed hub name without characters that cannot appear in a file name.
pub fn hub_name(name: &str) -> String {
    let cleaned = literature_notes::sanitize_file_name(name);
    if cleaned.starts_with(HUB_PREFIX) {
        cleaned
    } else {
        format!("{HUB_PREFIX}{cleaned}")
    }
}

fn describe(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("---"))
        .map(|l| l.chars().take(MAX_DESCRIPTION_CHARS).collect())
        .unwrap_or_default()
}
