use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the processing snapshot inside the state directory.
pub const STATE_FILE: &str = "zotero_sync_state.json";
/// File name of the extraction cache inside the PDF (or state) directory.
pub const CACHE_FILE: &str = "extracted_papers.json";

pub const DEFAULT_ZOTERO_API_URL: &str = "https://api.zotero.org";
pub const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CROSSREF_API_URL: &str = "https://api.crossref.org";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_GEMINI_MODEL_LITE: &str = "gemini-2.5-flash-lite";

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Folder of literature notes (`MARKDOWN_DIR`)
    pub notes_dir: PathBuf,
    /// Folder of topic hub notes; defaults to the notes folder
    pub topics_dir: PathBuf,
    /// Folder of PDFs for manual ingest
    pub pdf_dir: Option<PathBuf>,
    /// Where the processing snapshot lives
    pub state_dir: PathBuf,
    pub zotero: Option<ZoteroConfig>,
    pub gemini: Option<GeminiConfig>,
    pub crossref: CrossrefConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    User,
    Group,
}

impl LibraryKind {
    /// Path segment of the library prefix, e.g. `users/12345`.
    pub fn path_segment(self) -> &'static str {
        match self {
            LibraryKind::User => "users",
            LibraryKind::Group => "groups",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZoteroConfig {
    pub library_id: String,
    pub library_kind: LibraryKind,
    pub api_key: String,
    /// Local Zotero `storage` folder holding attachment PDFs
    pub storage_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Attach analysis notes to library items
    pub note_sync: bool,
    /// Pause after every API call
    pub api_delay: Duration,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub lite_model: String,
    pub timeout: Duration,
    pub request_delay: Duration,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct CrossrefConfig {
    pub mailto: Option<String>,
    pub delay: Duration,
    pub api_url: String,
}

impl Config {
    /// Load configuration from the process environment, after reading a
    /// `.env` file from the working directory if there is one.
    ///
    /// Required environment variables:
    /// - `MARKDOWN_DIR`: Folder of literature notes (supports ~ for home directory)
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let path = |key: &str| get(key).map(|v| expand_tilde(&v));

        let notes_dir = path("MARKDOWN_DIR").ok_or(ConfigError::Missing("MARKDOWN_DIR"))?;
        let topics_dir = path("TOPICS_DIR").unwrap_or_else(|| notes_dir.clone());
        let pdf_dir = path("PDF_DIR");
        let state_dir = path("STATE_DIR").unwrap_or_else(|| default_state_dir(&notes_dir));

        let zotero = match (get("ZOTERO_LIBRARY_ID"), get("ZOTERO_API_KEY")) {
            (Some(library_id), Some(api_key)) => Some(ZoteroConfig {
                library_id,
                library_kind: match get("ZOTERO_LIBRARY_TYPE").as_deref() {
                    None | Some("user") => LibraryKind::User,
                    Some("group") => LibraryKind::Group,
                    Some(other) => {
                        return Err(ConfigError::Invalid {
                            key: "ZOTERO_LIBRARY_TYPE",
                            value: other.to_string(),
                            reason: "expected \"user\" or \"group\"".to_string(),
                        });
                    }
                },
                api_key,
                storage_dir: path("ZOTERO_STORAGE"),
                poll_interval: seconds(&get, "ZOTERO_POLL_INTERVAL", 60.0)?,
                note_sync: flag(&get, "ZOTERO_NOTE_SYNC", true)?,
                api_delay: seconds(&get, "ZOTERO_API_DELAY", 0.5)?,
                api_url: get("ZOTERO_API_URL").unwrap_or_else(|| DEFAULT_ZOTERO_API_URL.to_string()),
            }),
            _ => None,
        };

        let gemini = match get("GEMINI_API_KEY") {
            Some(api_key) => Some(GeminiConfig {
                api_key,
                model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
                lite_model: get("GEMINI_MODEL_LITE")
                    .unwrap_or_else(|| DEFAULT_GEMINI_MODEL_LITE.to_string()),
                timeout: seconds(&get, "GEMINI_TIMEOUT", 120.0)?,
                request_delay: seconds(&get, "GEMINI_REQUEST_DELAY", 4.0)?,
                api_url: get("GEMINI_API_URL").unwrap_or_else(|| DEFAULT_GEMINI_API_URL.to_string()),
            }),
            None => None,
        };

        let crossref = CrossrefConfig {
            mailto: get("CROSSREF_MAILTO"),
            delay: seconds(&get, "CROSSREF_DELAY", 1.0)?,
            api_url: get("CROSSREF_API_URL").unwrap_or_else(|| DEFAULT_CROSSREF_API_URL.to_string()),
        };

        Ok(Self {
            notes_dir,
            topics_dir,
            pdf_dir,
            state_dir,
            zotero,
            gemini,
            crossref,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    /// The extraction cache sits next to the PDFs it describes.
    pub fn cache_path(&self) -> PathBuf {
        self.pdf_dir
            .as_deref()
            .unwrap_or(&self.state_dir)
            .join(CACHE_FILE)
    }

    pub fn require_zotero(&self) -> Result<&ZoteroConfig, ConfigError> {
        self.zotero
            .as_ref()
            .ok_or(ConfigError::Missing("ZOTERO_LIBRARY_ID and ZOTERO_API_KEY"))
    }

    pub fn require_gemini(&self) -> Result<&GeminiConfig, ConfigError> {
        self.gemini.as_ref().ok_or(ConfigError::Missing("GEMINI_API_KEY"))
    }

    pub fn require_pdf_dir(&self) -> Result<&Path, ConfigError> {
        self.pdf_dir.as_deref().ok_or(ConfigError::Missing("PDF_DIR"))
    }
}

/// `~/.local/share/papersync` (or the platform equivalent), else a hidden
/// folder inside the notes folder.
fn default_state_dir(notes_dir: &Path) -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("papersync"))
        .unwrap_or_else(|| notes_dir.join(".papersync"))
}

fn seconds<G>(get: &G, key: &'static str, default: f64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(Duration::from_secs_f64(default));
    };
    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: reason.to_string(),
    };
    let secs: f64 = raw.parse().map_err(|_| invalid("expected a number of seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid("must be zero or more"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn flag<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set (environment or .env file)")]
    Missing(&'static str),

    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
