//! Partitioning of duplicate candidates into equivalence groups.
//!
//! # Invariants
//! - Every candidate lands in exactly one group.
//! - Proteins sharing an accession form a single group.
//! - Transcripts group only when identity and the full parent set agree.

use crate::model::record::{Record, RecordId, RecordKind};
use serde::Serialize;
use std::collections::BTreeSet;

/// Grouping key of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCandidate {
    pub record_id: RecordId,
    /// Registry accession, upper-cased.
    pub identity: Option<String>,
    /// Primary ids of parent xrefs.
    pub parent_ids: Vec<String>,
}

impl DuplicateCandidate {
    pub fn from_record(record: &Record, registry_database: &str) -> Self {
        Self {
            record_id: record.id,
            identity: record
                .identity_xref(registry_database)
                .map(|xref| xref.primary_id.trim().to_ascii_uppercase()),
            parent_ids: record
                .parent_ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    fn parent_set(&self) -> BTreeSet<String> {
        self.parent_ids
            .iter()
            .map(|id| id.trim().to_ascii_lowercase())
            .collect()
    }
}

/// Records that must be merged into one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquivalenceGroup {
    pub kind: RecordKind,
    pub members: Vec<RecordId>,
}

impl EquivalenceGroup {
    pub fn needs_merge(&self) -> bool {
        self.members.len() > 1
    }
}

/// Partitions `candidates` of `kind` into equivalence groups, keeping input
/// order inside each group.
pub fn group(candidates: &[DuplicateCandidate], kind: RecordKind) -> Vec<EquivalenceGroup> {
    if candidates.is_empty() {
        return Vec::new();
    }

    if kind == RecordKind::Protein {
        return vec![EquivalenceGroup {
            kind,
            members: candidates.iter().map(|candidate| candidate.record_id).collect(),
        }];
    }

    let mut keyed: Vec<((Option<String>, BTreeSet<String>), EquivalenceGroup)> = Vec::new();
    for candidate in candidates {
        let key = (candidate.identity.clone(), candidate.parent_set());
        match keyed.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, group)) => group.members.push(candidate.record_id),
            None => keyed.push((
                key,
                EquivalenceGroup {
                    kind,
                    members: vec![candidate.record_id],
                },
            )),
        }
    }

    keyed.into_iter().map(|(_, group)| group).collect()
}
