//! Merge of one equivalence group into a single surviving record.
//!
//! # Responsibility
//! - Pick the canonical record and fold every other member into it.
//! - Split a loser whose participations cannot follow it onto the
//!   survivor's sequence into a residual, no-longer-synced record.
//!
//! # Invariants
//! - Survivor is the earliest `created_at`, ties broken by lowest id.
//! - The participation count of the group is conserved: every participation
//!   ends on the survivor or on a residual record.
//! - A group merges all-or-nothing inside one savepoint.

use crate::model::record::{
    now_epoch_ms, Annotation, AnnotationOwner, CrossReference, Participation, ParticipationId,
    Record, RecordId, RecordKind,
};
use crate::model::vocabulary::{Qualifier, Topic};
use crate::reconcile::grouper::EquivalenceGroup;
use crate::reconcile::ranges::{
    plan_participation, ParticipationPlan, RangeConflict, RangeReconciler, RangeUpdateReport,
    ReconcileError,
};
use crate::reconcile::{AnnotationChange, EngineSettings, XrefChange};
use crate::registry::SequenceArchive;
use crate::repo::{RecordRepository, RepoError, XrefQuery};
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("group member {0} does not exist")]
    MissingRecord(RecordId),
    #[error("cannot merge an empty group")]
    EmptyGroup,
}

/// What happened to one non-canonical member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Deleted,
    /// Conflicting participations were split off to `residual_id`.
    DemotedWithResidual { residual_id: RecordId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoserOutcome {
    pub loser_id: RecordId,
    pub outcome: MergeOutcome,
    /// Ranges that kept a participation off the survivor.
    pub conflicts: Vec<RangeConflict>,
}

/// Audit trail of one group merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub survivor_id: RecordId,
    pub kind: RecordKind,
    pub losers: Vec<LoserOutcome>,
    pub moved_participations: Vec<ParticipationId>,
    pub residual_participations: Vec<ParticipationId>,
    pub xrefs_added: Vec<XrefChange>,
    pub xrefs_removed: Vec<XrefChange>,
    pub xrefs_rewritten: Vec<XrefChange>,
    pub annotations_added: Vec<AnnotationChange>,
    pub range_reports: Vec<RangeUpdateReport>,
    pub anomalies: Vec<String>,
}

impl MergeReport {
    fn new(survivor_id: RecordId, kind: RecordKind) -> Self {
        Self {
            survivor_id,
            kind,
            losers: Vec::new(),
            moved_participations: Vec::new(),
            residual_participations: Vec::new(),
            xrefs_added: Vec::new(),
            xrefs_removed: Vec::new(),
            xrefs_rewritten: Vec::new(),
            annotations_added: Vec::new(),
            range_reports: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    /// Records created by this merge.
    pub fn residual_ids(&self) -> Vec<RecordId> {
        self.losers
            .iter()
            .filter_map(|loser| match loser.outcome {
                MergeOutcome::DemotedWithResidual { residual_id } => Some(residual_id),
                MergeOutcome::Deleted => None,
            })
            .collect()
    }

    /// Losers removed from the store.
    pub fn removed_ids(&self) -> Vec<RecordId> {
        self.losers.iter().map(|loser| loser.loser_id).collect()
    }
}

pub struct MergeEngine<'a, R, A: ?Sized> {
    repo: &'a R,
    archive: &'a A,
    settings: &'a EngineSettings,
}

impl<'a, R, A> MergeEngine<'a, R, A>
where
    R: RecordRepository,
    A: SequenceArchive + ?Sized,
{
    /// Creates an engine; `archive` backs range recovery on the survivor.
    pub fn new(repo: &'a R, archive: &'a A, settings: &'a EngineSettings) -> Self {
        Self {
            repo,
            archive,
            settings,
        }
    }

    /// Folds every member of `group` into its canonical record.
    ///
    /// `target_sequence` is the survivor's final sequence; loser ranges are
    /// remapped onto it.
    pub fn merge(
        &self,
        group: &EquivalenceGroup,
        target_sequence: Option<&str>,
    ) -> Result<MergeReport, MergeError> {
        if group.members.is_empty() {
            return Err(MergeError::EmptyGroup);
        }
        self.repo
            .atomically("merge_group", || self.merge_members(group, target_sequence))
    }

    fn merge_members(
        &self,
        group: &EquivalenceGroup,
        target_sequence: Option<&str>,
    ) -> Result<MergeReport, MergeError> {
        let mut members = Vec::with_capacity(group.members.len());
        for id in &group.members {
            let record = self
                .repo
                .get_record(*id)?
                .ok_or(MergeError::MissingRecord(*id))?;
            members.push(record);
        }

        let survivor_index = members
            .iter()
            .enumerate()
            .min_by_key(|(_, record)| (record.created_at, record.id))
            .map(|(index, _)| index)
            .ok_or(MergeError::EmptyGroup)?;
        let mut survivor = members.remove(survivor_index);
        let mut report = MergeReport::new(survivor.id, group.kind);

        for loser in members {
            self.fold_loser(&mut survivor, loser, target_sequence, &mut report)?;
        }

        if !report.losers.is_empty() {
            info!(
                "event=merge_group module=merge status=ok survivor={} losers={} moved={} residuals={}",
                report.survivor_id,
                report.losers.len(),
                report.moved_participations.len(),
                report.residual_ids().len()
            );
        }
        Ok(report)
    }

    fn fold_loser(
        &self,
        survivor: &mut Record,
        loser: Record,
        target_sequence: Option<&str>,
        report: &mut MergeReport,
    ) -> Result<(), MergeError> {
        let participations = self.repo.list_participations(loser.id)?;
        let mut moved = Vec::new();
        let mut conflicting: Vec<(Participation, ParticipationPlan)> = Vec::new();

        for participation in participations {
            let plan = plan_participation(&participation, loser.sequence.as_deref(), target_sequence);
            if plan.is_clean() {
                self.repo.move_participation(participation.id, survivor.id)?;
                report.moved_participations.push(participation.id);
                moved.push(participation);
            } else {
                conflicting.push((participation, plan));
            }
        }

        if !moved.is_empty() {
            let reconciler = RangeReconciler::new(self.repo, self.archive, self.settings);
            let range_report = reconciler.reconcile_participations(
                &loser,
                &moved,
                loser.sequence.as_deref(),
                target_sequence,
            )?;
            if !range_report.is_empty() {
                report.range_reports.push(range_report);
            }
        }

        for xref in loser
            .xrefs
            .iter()
            .filter(|xref| xref.qualifier != Qualifier::Identity)
        {
            self.add_xref_once(survivor, xref.duplicate(), report)?;
        }
        let secondary = CrossReference::new(
            self.settings.local_database.clone(),
            Qualifier::RecordSecondary,
            loser.id.to_string(),
        );
        self.add_xref_once(survivor, secondary, report)?;

        self.rewrite_parent_xrefs(loser.id, survivor.id, report)?;

        let conflicts: Vec<RangeConflict> = conflicting
            .iter()
            .flat_map(|(_, plan)| plan.conflicts.iter().cloned())
            .collect();
        let outcome = if conflicting.is_empty() {
            MergeOutcome::Deleted
        } else {
            let residual_id = self.split_residual(&loser, survivor.id, &conflicting, report)?;
            MergeOutcome::DemotedWithResidual { residual_id }
        };

        self.repo.delete_record(loser.id)?;
        match &outcome {
            MergeOutcome::Deleted => info!(
                "event=merge_loser module=merge status=ok loser={} survivor={} outcome=deleted",
                loser.id, survivor.id
            ),
            MergeOutcome::DemotedWithResidual { residual_id } => warn!(
                "event=merge_loser module=merge status=ok loser={} survivor={} outcome=demoted residual={residual_id} conflicts={}",
                loser.id,
                survivor.id,
                conflicts.len()
            ),
        }
        report.losers.push(LoserOutcome {
            loser_id: loser.id,
            outcome,
            conflicts,
        });
        Ok(())
    }

    fn add_xref_once(
        &self,
        survivor: &mut Record,
        xref: CrossReference,
        report: &mut MergeReport,
    ) -> Result<(), MergeError> {
        if survivor.xrefs.iter().any(|existing| existing.same_target(&xref)) {
            return Ok(());
        }
        self.repo.add_xref(survivor.id, &xref)?;
        report.xrefs_added.push(XrefChange::of(survivor.id, &xref));
        survivor.xrefs.push(xref);
        Ok(())
    }

    /// Points transcripts of `loser` at `survivor`.
    fn rewrite_parent_xrefs(
        &self,
        loser_id: RecordId,
        survivor_id: RecordId,
        report: &mut MergeReport,
    ) -> Result<(), MergeError> {
        let loser_key = loser_id.to_string();
        let survivor_key = survivor_id.to_string();
        let query = XrefQuery::new(self.settings.local_database.clone(), None, loser_key.clone());

        for transcript in self.repo.find_by_xref(&query)? {
            let mut parents = transcript.xrefs.iter().filter(|xref| {
                xref.qualifier.is_parent()
                    && self.settings.is_local(xref)
                    && xref.primary_id.eq_ignore_ascii_case(&loser_key)
            });
            let Some(first) = parents.next() else {
                continue;
            };

            let already_linked = transcript.xrefs.iter().any(|xref| {
                xref.qualifier == first.qualifier
                    && self.settings.is_local(xref)
                    && xref.primary_id.eq_ignore_ascii_case(&survivor_key)
            });
            if already_linked {
                self.repo.remove_xref(first.id)?;
                report.xrefs_removed.push(XrefChange::of(transcript.id, first));
            } else {
                let mut rewritten = first.clone();
                rewritten.primary_id = survivor_key.clone();
                self.repo.update_xref(&rewritten)?;
                report
                    .xrefs_rewritten
                    .push(XrefChange::of(transcript.id, &rewritten));
            }

            for extra in parents {
                let anomaly = format!(
                    "transcript {} had more than one parent xref to {loser_id}; removed {}",
                    transcript.id, extra.id
                );
                warn!(
                    "event=parent_xref_anomaly module=merge status=error transcript={} loser={loser_id} xref={}",
                    transcript.id, extra.id
                );
                self.repo.remove_xref(extra.id)?;
                report.xrefs_removed.push(XrefChange::of(transcript.id, extra));
                report.anomalies.push(anomaly);
            }
        }
        Ok(())
    }

    /// Clones `loser` into a no-longer-synced record holding the
    /// participations that could not move.
    fn split_residual(
        &self,
        loser: &Record,
        survivor_id: RecordId,
        conflicting: &[(Participation, ParticipationPlan)],
        report: &mut MergeReport,
    ) -> Result<RecordId, MergeError> {
        let mut residual = Record {
            id: Uuid::new_v4(),
            kind: loser.kind,
            short_label: loser.short_label.clone(),
            sequence: loser.sequence.clone(),
            sequence_version: loser.sequence_version,
            organism_taxid: loser.organism_taxid,
            created_at: now_epoch_ms(),
            xrefs: loser.xrefs.iter().map(CrossReference::duplicate).collect(),
            annotations: loser
                .annotations
                .iter()
                .filter(|annotation| annotation.topic != Topic::NoLongerSynced)
                .map(Annotation::duplicate)
                .collect(),
        };
        let tags = [
            Annotation::new(Topic::NoLongerSynced, None),
            Annotation::new(
                Topic::Caution,
                Some(self.settings.residual_caution_text(loser.id, survivor_id)),
            ),
        ];
        for tag in tags {
            report
                .annotations_added
                .push(AnnotationChange::of(AnnotationOwner::Record(residual.id), &tag));
            residual.annotations.push(tag);
        }

        self.repo.create_record(&residual)?;
        for (participation, _) in conflicting {
            self.repo.move_participation(participation.id, residual.id)?;
            report.residual_participations.push(participation.id);
        }
        Ok(residual.id)
    }
}

#[cfg(test)]
mod tests {
    use super::{MergeOutcome, MergeReport};
    use crate::model::record::RecordKind;
    use uuid::Uuid;

    #[test]
    fn report_lists_residuals_and_removed_losers() {
        let mut report = MergeReport::new(Uuid::new_v4(), RecordKind::Protein);
        let residual_id = Uuid::new_v4();
        report.losers.push(super::LoserOutcome {
            loser_id: Uuid::new_v4(),
            outcome: MergeOutcome::Deleted,
            conflicts: Vec::new(),
        });
        report.losers.push(super::LoserOutcome {
            loser_id: Uuid::new_v4(),
            outcome: MergeOutcome::DemotedWithResidual { residual_id },
            conflicts: Vec::new(),
        });

        assert_eq!(report.residual_ids(), vec![residual_id]);
        assert_eq!(report.removed_ids().len(), 2);
    }
}
