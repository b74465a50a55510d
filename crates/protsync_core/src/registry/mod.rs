//! Authoritative registry collaborators.
//!
//! # Responsibility
//! - Define the registry lookup and historical-sequence contracts consumed
//!   by the engine.
//! - Provide snapshot-file implementations of both for batch runs and tests.
//!
//! # Invariants
//! - Lookups are synchronous and side-effect free.
//! - A withdrawn accession is reported as `NotFound`, never as an error.

use std::path::PathBuf;
use thiserror::Error;

pub mod archive;
pub mod client;

pub use archive::{ArchiveError, SequenceArchive, SnapshotArchive};
pub use client::{
    RegistryClient, RegistryEntry, RegistryError, RegistryLookup, RegistryTranscript,
    SnapshotRegistry,
};

/// Failure reading a snapshot file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid snapshot content: {0}")]
    Invalid(String),
}

pub(crate) fn read_snapshot(path: &std::path::Path) -> Result<String, SnapshotError> {
    std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}
