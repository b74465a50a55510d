//! Core synchronization engine for curated protein records.
//! This crate owns every reconciliation invariant; the CLI only wires it up.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod repo;
pub mod service;

pub use config::{ConfigError, LoggingConfig, SyncConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget, LoggingError};
pub use model::range::{Position, PositionStatus, Range, RangeId, RangePositionError};
pub use model::record::{
    Annotation, AnnotationOwner, CrossReference, Feature, Participation, Record, RecordId,
    RecordKind,
};
pub use model::vocabulary::{Qualifier, TermCategory, Topic};
pub use reconcile::{locate, AlignmentOutcome, EngineSettings};
pub use registry::{
    RegistryClient, RegistryEntry, RegistryLookup, SequenceArchive, SnapshotArchive,
    SnapshotRegistry,
};
pub use repo::{RecordRepository, RepoError, RepoResult, SqliteRecordRepository};
pub use service::{AccessionOutcome, AccessionStatus, BatchReport, UpdateError, UpdateService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
