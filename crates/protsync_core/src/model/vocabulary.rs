//! Controlled vocabulary used to tag annotations and cross-references.
//!
//! # Responsibility
//! - Name every annotation topic and xref qualifier the engine reads or writes.
//! - Map those names to their persisted short labels and back.
//!
//! # Invariants
//! - Short labels are lowercase and stable; they are the persisted identity
//!   of a term in `cv_terms`.
//! - Unknown labels round-trip through the `Other` variants untouched.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Category of a controlled-vocabulary term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermCategory {
    Topic,
    Database,
    Qualifier,
}

impl TermCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Database => "database",
            Self::Qualifier => "qualifier",
        }
    }
}

/// One resolved vocabulary row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvTerm {
    pub id: i64,
    pub category: TermCategory,
    pub short_label: String,
}

/// Annotation topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Topic {
    /// Record is excluded from registry synchronization.
    NoLongerSynced,
    /// Free-text warning for curators.
    Caution,
    /// Range could not be remapped; text carries the cause.
    InvalidRange,
    /// Pre-conflict position string of a range, used for later recovery.
    RangeConflicts,
    /// Range positions never fit the sequence they were recorded against.
    InvalidPositions,
    /// Registry sequence version the conflicting positions refer to.
    SequenceVersion,
    Other(String),
}

impl Topic {
    pub fn label(&self) -> &str {
        match self {
            Self::NoLongerSynced => "no-longer-synced",
            Self::Caution => "caution",
            Self::InvalidRange => "invalid-range",
            Self::RangeConflicts => "range-conflicts",
            Self::InvalidPositions => "invalid-positions",
            Self::SequenceVersion => "sequence-version",
            Self::Other(label) => label.as_str(),
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "no-longer-synced" => Self::NoLongerSynced,
            "caution" => Self::Caution,
            "invalid-range" => Self::InvalidRange,
            "range-conflicts" => Self::RangeConflicts,
            "invalid-positions" => Self::InvalidPositions,
            "sequence-version" => Self::SequenceVersion,
            _ => Self::Other(normalized),
        }
    }

    /// Whether this topic belongs to the per-range ledger kept on features.
    pub fn is_range_ledger(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange | Self::RangeConflicts | Self::InvalidPositions | Self::SequenceVersion
        )
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.label().to_string()
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Self::from_label(&value)
    }
}

/// Cross-reference qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Qualifier {
    /// Authoritative accession of the record.
    Identity,
    /// Superseded accession.
    SecondaryId,
    /// Same-database self reference: "this record absorbed record X".
    RecordSecondary,
    /// Isoform transcript -> master record.
    IsoformParent,
    /// Feature-chain transcript -> master record.
    ChainParent,
    /// Identity of a retired record.
    RemovedAccession,
    Other(String),
}

impl Qualifier {
    pub fn label(&self) -> &str {
        match self {
            Self::Identity => "identity",
            Self::SecondaryId => "secondary-id",
            Self::RecordSecondary => "record-secondary",
            Self::IsoformParent => "isoform-parent",
            Self::ChainParent => "chain-parent",
            Self::RemovedAccession => "removed-accession",
            Self::Other(label) => label.as_str(),
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "identity" => Self::Identity,
            "secondary-id" => Self::SecondaryId,
            "record-secondary" => Self::RecordSecondary,
            "isoform-parent" => Self::IsoformParent,
            "chain-parent" => Self::ChainParent,
            "removed-accession" => Self::RemovedAccession,
            _ => Self::Other(normalized),
        }
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, Self::IsoformParent | Self::ChainParent)
    }
}

impl Display for Qualifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl From<Qualifier> for String {
    fn from(value: Qualifier) -> Self {
        value.label().to_string()
    }
}

impl From<String> for Qualifier {
    fn from(value: String) -> Self {
        Self::from_label(&value)
    }
}
