//! Curated record domain model.
//!
//! # Responsibility
//! - Define records, cross-references, annotations, participations and
//!   features as flat, id-keyed values.
//! - Provide the identity and parent queries the reconciliation engine asks
//!   of a record.
//!
//! # Invariants
//! - Every entity carries a stable UUID that is never reused.
//! - Ownership flows downwards only (record -> participation -> feature ->
//!   range); upward links are ids, never references.
//! - An annotation describing a range links it through `range_id`.

use crate::model::range::{Range, RangeId};
use crate::model::vocabulary::{Qualifier, Topic};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type RecordId = Uuid;
pub type XrefId = Uuid;
pub type AnnotationId = Uuid;
pub type ParticipationId = Uuid;
pub type FeatureId = Uuid;

/// Kind of curated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Master protein entry.
    Protein,
    /// Splice variant transcript of a master protein.
    Isoform,
    /// Processed chain transcript of a master protein.
    FeatureChain,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protein => "protein",
            Self::Isoform => "isoform",
            Self::FeatureChain => "feature_chain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "protein" => Some(Self::Protein),
            "isoform" => Some(Self::Isoform),
            "feature_chain" => Some(Self::FeatureChain),
            _ => None,
        }
    }

    /// Qualifier of the xref linking a transcript of this kind to its master.
    pub fn parent_qualifier(self) -> Option<Qualifier> {
        match self {
            Self::Protein => None,
            Self::Isoform => Some(Qualifier::IsoformParent),
            Self::FeatureChain => Some(Qualifier::ChainParent),
        }
    }
}

/// Typed pointer from a record to an external or internal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub id: XrefId,
    pub database: String,
    pub qualifier: Qualifier,
    pub primary_id: String,
    pub release: Option<String>,
}

impl CrossReference {
    pub fn new(
        database: impl Into<String>,
        qualifier: Qualifier,
        primary_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            database: database.into(),
            qualifier,
            primary_id: primary_id.into(),
            release: None,
        }
    }

    pub fn with_release(mut self, release: Option<String>) -> Self {
        self.release = release;
        self
    }

    /// Same database, qualifier and primary id (case-insensitive id match).
    pub fn same_target(&self, other: &CrossReference) -> bool {
        self.database.eq_ignore_ascii_case(&other.database)
            && self.qualifier == other.qualifier
            && self.primary_id.eq_ignore_ascii_case(&other.primary_id)
    }

    /// Copy of this xref with a fresh id, for attaching to another record.
    pub fn duplicate(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// Topic-tagged free text attached to a record or feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub topic: Topic,
    pub text: Option<String>,
    pub range_id: Option<RangeId>,
}

impl Annotation {
    pub fn new(topic: Topic, text: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            text,
            range_id: None,
        }
    }

    pub fn for_range(topic: Topic, range_id: RangeId, text: Option<String>) -> Self {
        Self {
            range_id: Some(range_id),
            ..Self::new(topic, text)
        }
    }

    /// Case-insensitive text comparison; `None` only equals `None`.
    pub fn text_matches(&self, text: Option<&str>) -> bool {
        match (self.text.as_deref(), text) {
            (Some(left), Some(right)) => left.trim().eq_ignore_ascii_case(right.trim()),
            (None, None) => true,
            _ => false,
        }
    }

    pub fn duplicate(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// Owner of an annotation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner", content = "id", rename_all = "snake_case")]
pub enum AnnotationOwner {
    Record(RecordId),
    Feature(FeatureId),
}

/// Curated protein or transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub short_label: String,
    pub sequence: Option<String>,
    /// Registry sequence version `sequence` was taken from.
    pub sequence_version: Option<u32>,
    pub organism_taxid: Option<i32>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub xrefs: Vec<CrossReference>,
    pub annotations: Vec<Annotation>,
}

impl Record {
    pub fn new(kind: RecordKind, short_label: impl Into<String>) -> Self {
        Self::with_created_at(kind, short_label, now_epoch_ms())
    }

    pub fn with_created_at(kind: RecordKind, short_label: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            short_label: short_label.into(),
            sequence: None,
            sequence_version: None,
            organism_taxid: None,
            created_at,
            xrefs: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// The `identity` xref in `database`, if any.
    pub fn identity_xref(&self, database: &str) -> Option<&CrossReference> {
        self.xrefs.iter().find(|xref| {
            xref.qualifier == Qualifier::Identity && xref.database.eq_ignore_ascii_case(database)
        })
    }

    /// Accession this record is (or was, once retired) identified by.
    pub fn identity_accession(&self, database: &str) -> Option<&str> {
        self.identity_xref(database)
            .or_else(|| {
                self.xrefs.iter().find(|xref| {
                    xref.qualifier == Qualifier::RemovedAccession
                        && xref.database.eq_ignore_ascii_case(database)
                })
            })
            .map(|xref| xref.primary_id.as_str())
    }

    /// Primary ids of every parent-relationship xref.
    pub fn parent_ids(&self) -> Vec<&str> {
        self.xrefs
            .iter()
            .filter(|xref| xref.qualifier.is_parent())
            .map(|xref| xref.primary_id.as_str())
            .collect()
    }

    pub fn annotations_with<'a>(
        &'a self,
        topic: &'a Topic,
    ) -> impl Iterator<Item = &'a Annotation> + 'a {
        self.annotations
            .iter()
            .filter(move |annotation| &annotation.topic == topic)
    }

    /// Records tagged `no-longer-synced` are left out of registry updates.
    pub fn is_sync_excluded(&self) -> bool {
        self.annotations_with(&Topic::NoLongerSynced).next().is_some()
    }
}

/// Active instance of a record in one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub id: ParticipationId,
    pub record_id: RecordId,
    pub interaction_ac: String,
    pub features: Vec<Feature>,
}

impl Participation {
    pub fn new(record_id: RecordId, interaction_ac: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            interaction_ac: interaction_ac.into(),
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, mut feature: Feature) -> Self {
        feature.participation_id = self.id;
        self.features.push(feature);
        self
    }
}

/// Annotated region of a participation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub participation_id: ParticipationId,
    pub short_label: String,
    pub ranges: Vec<Range>,
    pub annotations: Vec<Annotation>,
}

impl Feature {
    pub fn new(short_label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            participation_id: Uuid::nil(),
            short_label: short_label.into(),
            ranges: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.ranges.push(range);
        self
    }

    /// Looks up one of this feature's ranges by id.
    pub fn range(&self, range_id: RangeId) -> Option<&Range> {
        self.ranges.iter().find(|range| range.id == range_id)
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
