//! sync-core: reconciliation engine between a reference library and a folder
//! of generated literature notes.
//!
//! This crate provides:
//! - The processing snapshot (`state`) and the remote change detector
//! - The field-level merge engine shared by live sync and repair tooling
//! - Note change watching with self-write suppression
//! - The analysis stage with its per-model circuit breaker
//! - The per-cycle pipeline orchestrator
//! - Repair commands (import, enrich, field migration, dedupe, manual ingest)
//! - `Library`, `LlmBackend`, `Extractor` and `MetadataSource` trait
//!   abstractions, with an in-memory library for tests

pub mod analysis;
pub mod annotation;
pub mod breaker;
pub mod detector;
pub mod extraction;
pub mod fs;
pub mod index;
pub mod library;
pub mod pipeline;
pub mod reconcile;
pub mod repair;
pub mod state;
pub mod topics;
pub mod watcher;

pub use analysis::{Analysis, AnalysisError, Analyzer, LlmBackend, LlmError, TopicAssignment};
pub use breaker::{CircuitBreaker, ModelStatus};
pub use detector::{get_new_items, Classification};
pub use extraction::{
    ingest_folder, locate_attachment, CacheError, ExtractError, ExtractedDocument, ExtractionCache,
    Extractor, PdfMetadata,
};
pub use index::NoteIndex;
pub use library::{
    FieldUpdate, InMemoryLibrary, Item, ItemData, Library, LibraryError, RemoteField,
};
pub use pipeline::{
    generate_note, CycleReport, ItemOutcome, Orchestrator, OrchestratorConfig, PipelineError,
};
pub use reconcile::{merge_fields, MergeError};
pub use repair::{MetadataError, MetadataSource, RepairError, RepairReport};
pub use state::{ProcessingState, StateStore};
pub use topics::TopicHubs;
pub use watcher::NoteWatcher;
