//! sync-daemon library: the concrete services behind the `papersync` binary.
//!
//! Exposed as a library so integration tests can drive the HTTP clients
//! against mock servers.

pub mod config;
pub mod crossref;
pub mod gemini;
pub mod pdf;
pub mod zotero;

pub use config::{Config, ConfigError};
pub use crossref::CrossrefClient;
pub use gemini::GeminiClient;
pub use pdf::LopdfExtractor;
pub use zotero::ZoteroClient;
