//! Literature note model for the papersync workspace.
//!
//! Pure functions and types with no I/O: title/tag fingerprints, the
//! structured note document (parse, targeted edits, byte-exact
//! re-serialization), citation fields, and rendering of freshly generated
//! notes. Reading and writing files is left to `sync-core`.

pub mod citation;
pub mod fingerprint;
pub mod note;
pub mod render;

pub use citation::{Biblio, CitationField};
pub use fingerprint::{normalize_tag, normalize_title, ContentHash};
pub use note::{Note, NoteError};
pub use render::{build_filename, render_note, sanitize_file_name, NoteDraft, SectionText};
