//! Historical sequence archive contract and snapshot implementation.

use crate::registry::{read_snapshot, SnapshotError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("sequence archive unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Past sequence versions published by the registry.
pub trait SequenceArchive {
    /// Sequence of `accession` at `version`, or `None` when not archived.
    fn sequence_at(&self, accession: &str, version: u32) -> Result<Option<String>, ArchiveError>;
}

#[derive(Debug, Deserialize)]
struct ArchivedSequence {
    accession: String,
    version: u32,
    sequence: String,
}

#[derive(Debug, Default, Deserialize)]
struct ArchiveSnapshotFile {
    #[serde(default)]
    sequences: Vec<ArchivedSequence>,
}

/// In-memory archive built from a JSON snapshot. The default is empty.
#[derive(Debug, Clone, Default)]
pub struct SnapshotArchive {
    sequences: HashMap<(String, u32), String>,
}

impl SnapshotArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, SnapshotError> {
        let file: ArchiveSnapshotFile = serde_json::from_str(json)?;
        let mut archive = Self::new();
        for archived in file.sequences {
            archive.insert(archived.accession, archived.version, archived.sequence);
        }
        Ok(archive)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        Self::from_json_str(&read_snapshot(path.as_ref())?)
    }

    pub fn insert(&mut self, accession: impl Into<String>, version: u32, sequence: impl Into<String>) {
        self.sequences.insert(
            (accession.into().to_ascii_uppercase(), version),
            sequence.into(),
        );
    }
}

impl SequenceArchive for SnapshotArchive {
    fn sequence_at(&self, accession: &str, version: u32) -> Result<Option<String>, ArchiveError> {
        Ok(self
            .sequences
            .get(&(accession.trim().to_ascii_uppercase(), version))
            .cloned())
    }
}
