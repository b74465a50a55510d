//! Identity transitions: secondary-accession promotion and dead retirement.
//!
//! # Responsibility
//! - Rewrite a record's identity xref when its accession became secondary.
//! - Retire records whose accession was withdrawn from the registry.
//!
//! # Invariants
//! - An organism conflict leaves the record untouched and is reported.
//! - `retire_dead` is idempotent: a second run changes nothing.
//! - A retired record keeps exactly one `removed-accession` xref for its
//!   dead accession plus its internal xrefs, and exactly one
//!   `no-longer-synced` and one fixed-text caution annotation.

use crate::model::record::{Annotation, AnnotationOwner, CrossReference, Record, RecordId};
use crate::model::vocabulary::{Qualifier, Topic};
use crate::reconcile::{AnnotationChange, EngineSettings, XrefChange};
use crate::repo::{RecordRepository, RepoResult};
use log::{info, warn};
use serde::Serialize;

/// Authoritative identity a secondary record is moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub new_primary_ac: String,
    pub release: Option<String>,
    /// Organism of the registry entry, when declared.
    pub organism_taxid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum ConflictKind {
    OrganismMismatch {
        record_taxid: i32,
        registry_taxid: i32,
    },
    /// Record carries no identity xref to rewrite.
    MissingIdentity,
    /// Accession is secondary to several registry entries.
    AmbiguousAccession { candidates: Vec<String> },
}

/// Identity update that was blocked and left for curators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityConflict {
    pub record_id: Option<RecordId>,
    pub accession: String,
    pub kind: ConflictKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted {
        record_id: RecordId,
        previous_ac: String,
        new_ac: String,
        xrefs_added: Vec<XrefChange>,
    },
    Unchanged {
        record_id: RecordId,
    },
    Conflict(IdentityConflict),
}

/// Changes made by one `retire_dead` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetirementReport {
    pub record_id: RecordId,
    pub dead_accession: Option<String>,
    pub annotations_added: Vec<AnnotationChange>,
    pub annotations_removed: Vec<AnnotationChange>,
    pub xrefs_requalified: Vec<XrefChange>,
    pub xrefs_removed: Vec<XrefChange>,
}

impl RetirementReport {
    /// True when the record was already fully retired.
    pub fn is_noop(&self) -> bool {
        self.annotations_added.is_empty()
            && self.annotations_removed.is_empty()
            && self.xrefs_requalified.is_empty()
            && self.xrefs_removed.is_empty()
    }
}

pub struct IdentityTransitionHandler<'a, R> {
    repo: &'a R,
    settings: &'a EngineSettings,
}

impl<'a, R: RecordRepository> IdentityTransitionHandler<'a, R> {
    /// Creates a handler writing through `repo`.
    pub fn new(repo: &'a R, settings: &'a EngineSettings) -> Self {
        Self { repo, settings }
    }

    /// Moves `record` to the accession it became secondary to.
    pub fn promote_secondary(
        &self,
        record: &Record,
        request: &PromotionRequest,
    ) -> RepoResult<PromotionOutcome> {
        let Some(identity) = record.identity_xref(&self.settings.registry_database) else {
            return Ok(PromotionOutcome::Conflict(IdentityConflict {
                record_id: Some(record.id),
                accession: request.new_primary_ac.clone(),
                kind: ConflictKind::MissingIdentity,
                message: format!("record {} has no identity xref to promote", record.id),
            }));
        };

        if identity
            .primary_id
            .eq_ignore_ascii_case(&request.new_primary_ac)
        {
            return Ok(PromotionOutcome::Unchanged {
                record_id: record.id,
            });
        }

        if let (Some(record_taxid), Some(registry_taxid)) =
            (record.organism_taxid, request.organism_taxid)
        {
            if record_taxid != registry_taxid {
                warn!(
                    "event=promote_secondary module=identity status=skip record={} from={} to={} reason=organism_mismatch",
                    record.id, identity.primary_id, request.new_primary_ac
                );
                return Ok(PromotionOutcome::Conflict(IdentityConflict {
                    record_id: Some(record.id),
                    accession: identity.primary_id.clone(),
                    kind: ConflictKind::OrganismMismatch {
                        record_taxid,
                        registry_taxid,
                    },
                    message: format!(
                        "{} cannot be promoted to {}: organism {record_taxid} differs from registry organism {registry_taxid}",
                        identity.primary_id, request.new_primary_ac
                    ),
                }));
            }
        }

        let previous_ac = identity.primary_id.clone();
        let mut rewritten = identity.clone();
        rewritten.primary_id = request.new_primary_ac.clone();
        rewritten.release = request.release.clone();
        self.repo.update_xref(&rewritten)?;

        let mut xrefs_added = Vec::new();
        let secondary = CrossReference::new(
            self.settings.registry_database.clone(),
            Qualifier::SecondaryId,
            previous_ac.clone(),
        )
        .with_release(request.release.clone());
        if !record
            .xrefs
            .iter()
            .any(|existing| existing.same_target(&secondary))
        {
            self.repo.add_xref(record.id, &secondary)?;
            xrefs_added.push(XrefChange::of(record.id, &secondary));
        }

        info!(
            "event=promote_secondary module=identity status=ok record={} from={previous_ac} to={}",
            record.id, request.new_primary_ac
        );
        Ok(PromotionOutcome::Promoted {
            record_id: record.id,
            previous_ac,
            new_ac: request.new_primary_ac.clone(),
            xrefs_added,
        })
    }

    /// Marks `record` as withdrawn from the registry.
    pub fn retire_dead(&self, record: &Record) -> RepoResult<RetirementReport> {
        let dead_accession = record
            .identity_accession(&self.settings.registry_database)
            .map(str::to_string);
        let mut report = RetirementReport {
            record_id: record.id,
            dead_accession: dead_accession.clone(),
            annotations_added: Vec::new(),
            annotations_removed: Vec::new(),
            xrefs_requalified: Vec::new(),
            xrefs_removed: Vec::new(),
        };

        self.ensure_single(record, Topic::NoLongerSynced, None, &mut report)?;
        self.ensure_single(
            record,
            Topic::Caution,
            Some(self.settings.dead_caution_text.as_str()),
            &mut report,
        )?;

        let mut kept_removed_accession = false;
        for xref in &record.xrefs {
            if self.settings.is_local(xref) {
                continue;
            }
            let is_dead_identity = self.settings.is_registry(xref)
                && dead_accession
                    .as_deref()
                    .is_some_and(|accession| xref.primary_id.eq_ignore_ascii_case(accession));

            match (&xref.qualifier, is_dead_identity, kept_removed_accession) {
                (Qualifier::RemovedAccession, true, false) => kept_removed_accession = true,
                (Qualifier::Identity, true, false) => {
                    let mut requalified = xref.clone();
                    requalified.qualifier = Qualifier::RemovedAccession;
                    self.repo.update_xref(&requalified)?;
                    report
                        .xrefs_requalified
                        .push(XrefChange::of(record.id, &requalified));
                    kept_removed_accession = true;
                }
                _ => {
                    self.repo.remove_xref(xref.id)?;
                    report.xrefs_removed.push(XrefChange::of(record.id, xref));
                }
            }
        }

        if report.is_noop() {
            info!(
                "event=retire_dead module=identity status=skip record={} reason=already_retired",
                record.id
            );
        } else {
            info!(
                "event=retire_dead module=identity status=ok record={} accession={} xrefs_removed={}",
                record.id,
                dead_accession.as_deref().unwrap_or("-"),
                report.xrefs_removed.len()
            );
        }
        Ok(report)
    }

    /// Keeps exactly one record annotation of `topic` (with `text`, when
    /// given), adding it when absent.
    fn ensure_single(
        &self,
        record: &Record,
        topic: Topic,
        text: Option<&str>,
        report: &mut RetirementReport,
    ) -> RepoResult<()> {
        let owner = AnnotationOwner::Record(record.id);
        let mut matching = record
            .annotations_with(&topic)
            .filter(|annotation| text.is_none() || annotation.text_matches(text));

        if matching.next().is_none() {
            let annotation = Annotation::new(topic.clone(), text.map(str::to_string));
            self.repo.add_annotation(owner, &annotation)?;
            report
                .annotations_added
                .push(AnnotationChange::of(owner, &annotation));
            return Ok(());
        }

        for duplicate in matching {
            self.repo.remove_annotation(duplicate.id)?;
            report
                .annotations_removed
                .push(AnnotationChange::of(owner, duplicate));
        }
        Ok(())
    }
}
