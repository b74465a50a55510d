//! Registry lookup contract and snapshot implementation.

use crate::model::record::RecordKind;
use crate::registry::{read_snapshot, SnapshotError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

/// Registry-side transcript (isoform or feature chain) of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTranscript {
    pub accession: String,
    pub kind: RecordKind,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default)]
    pub sequence_version: Option<u32>,
}

/// Authoritative entry for one accession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub accession: String,
    #[serde(default)]
    pub secondary_accessions: Vec<String>,
    #[serde(default)]
    pub organism_taxid: Option<i32>,
    pub sequence: String,
    #[serde(default)]
    pub sequence_version: Option<u32>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub transcripts: Vec<RegistryTranscript>,
}

impl RegistryEntry {
    pub fn transcript(&self, accession: &str, kind: RecordKind) -> Option<&RegistryTranscript> {
        self.transcripts
            .iter()
            .find(|transcript| transcript.kind == kind && transcript.accession.eq_ignore_ascii_case(accession))
    }
}

/// Result of resolving one accession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryLookup {
    Found(RegistryEntry),
    /// The accession is withdrawn (dead).
    NotFound,
    /// The accession is secondary to several entries.
    Ambiguous(Vec<String>),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Authoritative protein registry.
pub trait RegistryClient {
    fn resolve(&self, accession: &str) -> Result<RegistryLookup, RegistryError>;
}

#[derive(Debug, Default, Deserialize)]
struct RegistrySnapshotFile {
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

/// In-memory registry built from a JSON snapshot.
///
/// Secondary accessions resolve to the entry listing them.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    secondary_index: BTreeMap<String, BTreeSet<String>>,
}

impl SnapshotRegistry {
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let mut registry = Self::default();
        for entry in entries {
            registry.insert(entry);
        }
        registry
    }

    pub fn from_json_str(json: &str) -> Result<Self, SnapshotError> {
        let file: RegistrySnapshotFile = serde_json::from_str(json)?;
        for entry in &file.entries {
            if entry.accession.trim().is_empty() {
                return Err(SnapshotError::Invalid(
                    "registry entry with blank accession".to_string(),
                ));
            }
        }
        Ok(Self::from_entries(file.entries))
    }

    /// Reads a JSON snapshot file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        Self::from_json_str(&read_snapshot(path.as_ref())?)
    }

    /// Adds `entry`, replacing any entry with the same accession.
    pub fn insert(&mut self, entry: RegistryEntry) {
        let key = entry.accession.to_ascii_uppercase();
        for secondary in &entry.secondary_accessions {
            self.secondary_index
                .entry(secondary.to_ascii_uppercase())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    /// Number of primary entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegistryClient for SnapshotRegistry {
    fn resolve(&self, accession: &str) -> Result<RegistryLookup, RegistryError> {
        let key = accession.trim().to_ascii_uppercase();
        if let Some(entry) = self.entries.get(&key) {
            return Ok(RegistryLookup::Found(entry.clone()));
        }

        let Some(primaries) = self.secondary_index.get(&key) else {
            return Ok(RegistryLookup::NotFound);
        };
        let mut found: Vec<&RegistryEntry> = primaries
            .iter()
            .filter_map(|primary| self.entries.get(primary))
            .collect();
        match found.len() {
            0 => Ok(RegistryLookup::NotFound),
            1 => Ok(RegistryLookup::Found(found.remove(0).clone())),
            _ => Ok(RegistryLookup::Ambiguous(
                found.iter().map(|entry| entry.accession.clone()).collect(),
            )),
        }
    }
}
