//! Reconciliation engine.
//!
//! # Responsibility
//! - Remap feature ranges when a record's sequence changes.
//! - Partition duplicate candidates and merge each equivalence group.
//! - Promote secondary accessions and retire dead records.
//!
//! # Invariants
//! - Recoverable conditions (unplaceable ranges, organism conflicts,
//!   divergent duplicates) are recorded as annotations and report entries,
//!   never raised as errors.
//! - Every mutation made here is listed in the returned report.

use crate::model::range::RangeId;
use crate::model::record::{Annotation, AnnotationId, AnnotationOwner, CrossReference, RecordId, XrefId};
use crate::model::vocabulary::{Qualifier, Topic};
use serde::{Deserialize, Serialize};

pub mod aligner;
pub mod grouper;
pub mod identity;
pub mod merge;
pub mod ranges;

pub use aligner::{locate, AlignmentOutcome, ShiftedRange};
pub use grouper::{group, DuplicateCandidate, EquivalenceGroup};
pub use identity::{
    ConflictKind, IdentityConflict, IdentityTransitionHandler, PromotionOutcome, PromotionRequest,
    RetirementReport,
};
pub use merge::{LoserOutcome, MergeEngine, MergeError, MergeOutcome, MergeReport};
pub use ranges::{
    plan_participation, InvalidCause, ParticipationPlan, RangeReconciler, RangeUpdateReport,
    ReconcileError,
};

const DEFAULT_REGISTRY_DATABASE: &str = "uniprotkb";
const DEFAULT_LOCAL_DATABASE: &str = "intact";
const DEFAULT_DEAD_CAUTION: &str =
    "The accession of this protein was withdrawn from the registry; the record is no longer synchronized.";

/// Database names and fixed texts the engine writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Database of the authoritative accession xrefs.
    pub registry_database: String,
    /// Database of internal (same-database) xrefs.
    pub local_database: String,
    /// Caution text attached to retired records.
    #[serde(rename = "caution_text")]
    pub dead_caution_text: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            registry_database: DEFAULT_REGISTRY_DATABASE.to_string(),
            local_database: DEFAULT_LOCAL_DATABASE.to_string(),
            dead_caution_text: DEFAULT_DEAD_CAUTION.to_string(),
        }
    }
}

impl EngineSettings {
    pub fn is_local(&self, xref: &CrossReference) -> bool {
        xref.database.eq_ignore_ascii_case(&self.local_database)
    }

    pub fn is_registry(&self, xref: &CrossReference) -> bool {
        xref.database.eq_ignore_ascii_case(&self.registry_database)
    }

    /// Caution text attached to a residual record split off during merge.
    pub fn residual_caution_text(&self, loser: RecordId, survivor: RecordId) -> String {
        format!(
            "Split from duplicate {loser} while merging into {survivor}: feature ranges could not be remapped onto the surviving sequence."
        )
    }
}

/// Audit entry for one annotation written or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotationChange {
    pub owner: AnnotationOwner,
    pub annotation_id: AnnotationId,
    pub topic: Topic,
    pub range_id: Option<RangeId>,
    pub text: Option<String>,
}

impl AnnotationChange {
    pub fn of(owner: AnnotationOwner, annotation: &Annotation) -> Self {
        Self {
            owner,
            annotation_id: annotation.id,
            topic: annotation.topic.clone(),
            range_id: annotation.range_id,
            text: annotation.text.clone(),
        }
    }
}

/// Audit entry for one cross-reference written or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XrefChange {
    pub record_id: RecordId,
    pub xref_id: XrefId,
    pub database: String,
    pub qualifier: Qualifier,
    pub primary_id: String,
}

impl XrefChange {
    pub fn of(record_id: RecordId, xref: &CrossReference) -> Self {
        Self {
            record_id,
            xref_id: xref.id,
            database: xref.database.clone(),
            qualifier: xref.qualifier.clone(),
            primary_id: xref.primary_id.clone(),
        }
    }
}
