//! Range reconciliation across all features of a record.
//!
//! # Responsibility
//! - Shift ranges from an old sequence onto a new one.
//! - Keep the per-range ledger (`invalid-range`, `range-conflicts`,
//!   `invalid-positions`, `sequence-version`) on features in step with the
//!   ranges it describes.
//! - Recover previously conflicting ranges from archived sequence versions.
//!
//! # Invariants
//! - At most one ledger annotation exists per (range, topic); an existing
//!   one is updated in place, never duplicated.
//! - Ledger annotations whose range is gone or no longer undetermined are
//!   removed.
//! - A range that cannot be placed is rewritten to the canonical
//!   undetermined state; ranges are never deleted.

use crate::model::range::{Range, RangeId};
use crate::model::record::{Annotation, AnnotationId, AnnotationOwner, Feature, FeatureId, Participation, ParticipationId, Record, RecordId};
use crate::model::vocabulary::Topic;
use crate::reconcile::aligner::{locate, AlignmentOutcome};
use crate::reconcile::{AnnotationChange, EngineSettings};
use crate::registry::{ArchiveError, SequenceArchive};
use crate::repo::{RecordRepository, RepoError, RepoResult};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Why a range was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidCause {
    /// Range did not fit the previous sequence.
    OutOfBounds,
    /// Range residues could not be placed uniquely on the new sequence.
    Ambiguous,
    /// Record had no previous sequence and the range does not fit the new one.
    InvalidPositions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeShift {
    pub range_id: RangeId,
    pub feature_id: FeatureId,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRangeEntry {
    pub range_id: RangeId,
    pub feature_id: FeatureId,
    pub cause: InvalidCause,
    pub message: String,
    /// Positions the range had before it was rewritten to undetermined.
    pub previous_positions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrecoveredRange {
    pub range_id: RangeId,
    pub feature_id: FeatureId,
    pub reason: String,
}

/// Everything one reconciliation pass changed on a record's features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeUpdateReport {
    pub record_id: RecordId,
    pub shifted: Vec<RangeShift>,
    pub invalid: Vec<InvalidRangeEntry>,
    pub recovered: Vec<RangeShift>,
    pub unrecovered: Vec<UnrecoveredRange>,
    /// Ranges whose subsequence was recorded without a coordinate change.
    pub sequences_recorded: Vec<RangeId>,
    /// Undetermined ranges rewritten to zeroed bounds.
    pub normalized: Vec<RangeId>,
    pub annotations_added: Vec<AnnotationChange>,
    pub annotations_updated: Vec<AnnotationChange>,
    pub annotations_removed: Vec<AnnotationChange>,
}

impl RangeUpdateReport {
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            shifted: Vec::new(),
            invalid: Vec::new(),
            recovered: Vec::new(),
            unrecovered: Vec::new(),
            sequences_recorded: Vec::new(),
            normalized: Vec::new(),
            annotations_added: Vec::new(),
            annotations_updated: Vec::new(),
            annotations_removed: Vec::new(),
        }
    }

    /// True when the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.shifted.is_empty()
            && self.invalid.is_empty()
            && self.recovered.is_empty()
            && self.sequences_recorded.is_empty()
            && self.normalized.is_empty()
            && self.annotations_added.is_empty()
            && self.annotations_updated.is_empty()
            && self.annotations_removed.is_empty()
    }
}

/// A range that would be invalidated by moving its participation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeConflict {
    pub range_id: RangeId,
    pub feature_id: FeatureId,
    pub cause: InvalidCause,
    pub message: String,
}

/// Dry-run assessment of one participation against a target sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipationPlan {
    pub participation_id: ParticipationId,
    pub conflicts: Vec<RangeConflict>,
}

impl ParticipationPlan {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Checks, without writing anything, whether every determined range of
/// `participation` can be placed when moving from `old` to `new`.
pub fn plan_participation(
    participation: &Participation,
    old: Option<&str>,
    new: Option<&str>,
) -> ParticipationPlan {
    let mut conflicts = Vec::new();
    let Some(new) = new else {
        return ParticipationPlan {
            participation_id: participation.id,
            conflicts,
        };
    };

    for feature in &participation.features {
        for range in feature.ranges.iter().filter(|range| !range.is_undetermined()) {
            let conflict = match old {
                None => range.span(new.len()).err().map(|err| {
                    (InvalidCause::InvalidPositions, err.to_string())
                }),
                Some(old) if old == new => None,
                Some(old) => match locate(old, new, range) {
                    AlignmentOutcome::Shifted(_) => None,
                    AlignmentOutcome::OutOfBounds { message } => {
                        Some((InvalidCause::OutOfBounds, message))
                    }
                    AlignmentOutcome::Ambiguous { message } => {
                        Some((InvalidCause::Ambiguous, message))
                    }
                },
            };
            if let Some((cause, message)) = conflict {
                conflicts.push(RangeConflict {
                    range_id: range.id,
                    feature_id: feature.id,
                    cause,
                    message,
                });
            }
        }
    }

    ParticipationPlan {
        participation_id: participation.id,
        conflicts,
    }
}

/// Registry identity the ledger refers to while reconciling one record.
struct SequenceContext {
    accession: Option<String>,
    old_version: Option<u32>,
}

/// Orchestrates range remapping for the features of one record.
pub struct RangeReconciler<'a, R, A: ?Sized> {
    repo: &'a R,
    archive: &'a A,
    settings: &'a EngineSettings,
}

impl<'a, R, A> RangeReconciler<'a, R, A>
where
    R: RecordRepository,
    A: SequenceArchive + ?Sized,
{
    /// Creates a reconciler using the provided repository and archive.
    pub fn new(repo: &'a R, archive: &'a A, settings: &'a EngineSettings) -> Self {
        Self {
            repo,
            archive,
            settings,
        }
    }

    /// Reconciles every feature of `record` from `old` onto `new`.
    pub fn reconcile(
        &self,
        record: &Record,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<RangeUpdateReport, ReconcileError> {
        let participations = self.repo.list_participations(record.id)?;
        self.reconcile_participations(record, &participations, old, new)
    }

    /// Reconciles only the given participations.
    ///
    /// `record` supplies the registry accession and sequence version the
    /// ranges were recorded against; the participations may already belong
    /// to another record.
    pub fn reconcile_participations(
        &self,
        record: &Record,
        participations: &[Participation],
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<RangeUpdateReport, ReconcileError> {
        let context = SequenceContext {
            accession: record
                .identity_accession(&self.settings.registry_database)
                .map(str::to_string),
            old_version: record.sequence_version,
        };
        let mut report = RangeUpdateReport::new(record.id);

        for participation in participations {
            for feature in &participation.features {
                self.reconcile_feature(&context, feature, old, new, &mut report)?;
            }
        }

        if report.is_empty() {
            debug!(
                "event=range_reconcile module=reconcile status=skip record={} participations={}",
                record.id,
                participations.len()
            );
        } else {
            info!(
                "event=range_reconcile module=reconcile status=ok record={} shifted={} invalid={} recovered={} unrecovered={}",
                record.id,
                report.shifted.len(),
                report.invalid.len(),
                report.recovered.len(),
                report.unrecovered.len()
            );
        }
        Ok(report)
    }

    fn reconcile_feature(
        &self,
        context: &SequenceContext,
        feature: &Feature,
        old: Option<&str>,
        new: Option<&str>,
        report: &mut RangeUpdateReport,
    ) -> Result<(), ReconcileError> {
        let mut ledger = FeatureLedger::new(self.repo, feature);
        ledger.drop_stale(feature, report)?;

        for original in &feature.ranges {
            let mut range = original.clone();

            if ledger.find(&Topic::RangeConflicts, range.id).is_some() {
                self.recover(context, feature.id, &mut range, &mut ledger, new, report)?;
                continue;
            }
            if range.is_undetermined() {
                if !range.is_canonical_undetermined() {
                    range.set_undetermined();
                    self.repo.update_range(&range)?;
                    debug!(
                        "event=range_normalize module=reconcile status=ok feature={} range={}",
                        feature.id, range.id
                    );
                    report.normalized.push(range.id);
                }
                continue;
            }
            let Some(new) = new else {
                continue;
            };

            match old {
                None => self.record_subsequence(feature.id, &mut range, &mut ledger, new, report)?,
                Some(old) if old == new => {}
                Some(old) => match locate(old, new, &range) {
                    AlignmentOutcome::Shifted(shifted) => {
                        let before = range.position_string();
                        let moved = range.start != shifted.start || range.end != shifted.end;
                        if shifted.apply_to(&mut range) {
                            self.repo.update_range(&range)?;
                            if moved {
                                report.shifted.push(RangeShift {
                                    range_id: range.id,
                                    feature_id: feature.id,
                                    before,
                                    after: range.position_string(),
                                });
                            } else {
                                report.sequences_recorded.push(range.id);
                            }
                        }
                    }
                    AlignmentOutcome::OutOfBounds { message } => self.mark_conflict(
                        context,
                        feature.id,
                        &mut range,
                        InvalidCause::OutOfBounds,
                        message,
                        &mut ledger,
                        report,
                    )?,
                    AlignmentOutcome::Ambiguous { message } => self.mark_conflict(
                        context,
                        feature.id,
                        &mut range,
                        InvalidCause::Ambiguous,
                        message,
                        &mut ledger,
                        report,
                    )?,
                },
            }
        }

        Ok(())
    }

    /// Without a previous sequence there is nothing to shift from; the
    /// range's residues are read off the new sequence as they stand.
    fn record_subsequence(
        &self,
        feature_id: FeatureId,
        range: &mut Range,
        ledger: &mut FeatureLedger<'_, R>,
        new: &str,
        report: &mut RangeUpdateReport,
    ) -> RepoResult<()> {
        match range.span(new.len()) {
            Ok((first, last)) => {
                let residues = String::from_utf8_lossy(&new.as_bytes()[first..=last]).into_owned();
                if range.sequence.as_deref() != Some(residues.as_str()) {
                    range.sequence = Some(residues);
                    self.repo.update_range(range)?;
                    report.sequences_recorded.push(range.id);
                }
            }
            Err(err) => {
                let previous_positions = range.position_string();
                let message = format!(
                    "range {previous_positions} does not fit the new sequence: {err}"
                );
                ledger.upsert(Topic::InvalidPositions, range.id, Some(message.clone()), report)?;
                range.set_undetermined();
                self.repo.update_range(range)?;
                warn!(
                    "event=range_invalid module=reconcile status=invalid feature={feature_id} range={} cause=invalid_positions",
                    range.id
                );
                report.invalid.push(InvalidRangeEntry {
                    range_id: range.id,
                    feature_id,
                    cause: InvalidCause::InvalidPositions,
                    message,
                    previous_positions,
                });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_conflict(
        &self,
        context: &SequenceContext,
        feature_id: FeatureId,
        range: &mut Range,
        cause: InvalidCause,
        message: String,
        ledger: &mut FeatureLedger<'_, R>,
        report: &mut RangeUpdateReport,
    ) -> RepoResult<()> {
        let previous_positions = range.position_string();
        ledger.upsert(Topic::InvalidRange, range.id, Some(message.clone()), report)?;
        ledger.upsert(
            Topic::RangeConflicts,
            range.id,
            Some(previous_positions.clone()),
            report,
        )?;
        if let Some(version) = context.old_version {
            ledger.upsert(
                Topic::SequenceVersion,
                range.id,
                Some(version.to_string()),
                report,
            )?;
        }

        range.set_undetermined();
        self.repo.update_range(range)?;

        warn!(
            "event=range_invalid module=reconcile status=invalid feature={feature_id} range={} cause={cause:?} positions={previous_positions}",
            range.id
        );
        report.invalid.push(InvalidRangeEntry {
            range_id: range.id,
            feature_id,
            cause,
            message,
            previous_positions,
        });
        Ok(())
    }

    /// Retries a range that conflicted during an earlier update, starting
    /// from the archived sequence its recorded positions refer to.
    fn recover(
        &self,
        context: &SequenceContext,
        feature_id: FeatureId,
        range: &mut Range,
        ledger: &mut FeatureLedger<'_, R>,
        new: Option<&str>,
        report: &mut RangeUpdateReport,
    ) -> Result<(), ReconcileError> {
        let positions = ledger
            .find(&Topic::RangeConflicts, range.id)
            .and_then(|annotation| annotation.text.clone());
        let version = ledger
            .find(&Topic::SequenceVersion, range.id)
            .and_then(|annotation| annotation.text.as_deref())
            .and_then(|text| text.trim().parse::<u32>().ok());

        let reason = match (context.accession.as_deref(), version, new, positions) {
            (_, _, None, _) => "record has no current sequence".to_string(),
            (None, _, _, _) => "record has no registry accession".to_string(),
            (_, None, _, _) => "no recoverable sequence version is recorded".to_string(),
            (_, _, _, None) => "no conflicting positions are recorded".to_string(),
            (Some(accession), Some(version), Some(new), Some(positions)) => {
                match self.archive.sequence_at(accession, version)? {
                    None => format!("version {version} of {accession} is not archived"),
                    Some(historical) => match Range::parse_positions(&positions) {
                        Err(err) => err.to_string(),
                        Ok((start, end)) => {
                            let candidate = Range {
                                id: range.id,
                                start,
                                end,
                                sequence: None,
                            };
                            match locate(&historical, new, &candidate) {
                                AlignmentOutcome::Shifted(shifted) => {
                                    shifted.apply_to(range);
                                    self.repo.update_range(range)?;
                                    ledger.clear_range(range.id, report)?;
                                    info!(
                                        "event=range_recovered module=reconcile status=ok feature={feature_id} range={} from_version={version}",
                                        range.id
                                    );
                                    report.recovered.push(RangeShift {
                                        range_id: range.id,
                                        feature_id,
                                        before: positions,
                                        after: range.position_string(),
                                    });
                                    return Ok(());
                                }
                                AlignmentOutcome::OutOfBounds { message }
                                | AlignmentOutcome::Ambiguous { message } => message,
                            }
                        }
                    },
                }
            }
        };

        if let Some(version) = version {
            ledger.upsert(
                Topic::SequenceVersion,
                range.id,
                Some(version.to_string()),
                report,
            )?;
        }
        debug!(
            "event=range_recovery module=reconcile status=skip feature={feature_id} range={} reason={reason}",
            range.id
        );
        report.unrecovered.push(UnrecoveredRange {
            range_id: range.id,
            feature_id,
            reason,
        });
        Ok(())
    }
}

/// Working copy of a feature's annotations, written through to the repository.
struct FeatureLedger<'r, R> {
    repo: &'r R,
    feature_id: FeatureId,
    annotations: Vec<Annotation>,
}

impl<'r, R: RecordRepository> FeatureLedger<'r, R> {
    fn new(repo: &'r R, feature: &Feature) -> Self {
        Self {
            repo,
            feature_id: feature.id,
            annotations: feature.annotations.clone(),
        }
    }

    fn owner(&self) -> AnnotationOwner {
        AnnotationOwner::Feature(self.feature_id)
    }

    fn find(&self, topic: &Topic, range_id: RangeId) -> Option<&Annotation> {
        self.annotations
            .iter()
            .find(|annotation| &annotation.topic == topic && annotation.range_id == Some(range_id))
    }

    /// Removes ledger entries whose range is gone or no longer undetermined,
    /// and repeated entries for the same (range, topic).
    fn drop_stale(&mut self, feature: &Feature, report: &mut RangeUpdateReport) -> RepoResult<()> {
        let mut seen = HashSet::new();
        let mut stale: Vec<AnnotationId> = Vec::new();

        for annotation in self.annotations.iter().filter(|a| a.topic.is_range_ledger()) {
            let live = annotation
                .range_id
                .and_then(|range_id| feature.range(range_id))
                .is_some_and(Range::is_undetermined);
            let first_of_kind = seen.insert((annotation.topic.clone(), annotation.range_id));
            if !live || !first_of_kind {
                stale.push(annotation.id);
            }
        }

        for annotation_id in stale {
            self.remove(annotation_id, report)?;
        }
        Ok(())
    }

    fn upsert(
        &mut self,
        topic: Topic,
        range_id: RangeId,
        text: Option<String>,
        report: &mut RangeUpdateReport,
    ) -> RepoResult<()> {
        let owner = self.owner();
        if let Some(existing) = self
            .annotations
            .iter_mut()
            .find(|annotation| annotation.topic == topic && annotation.range_id == Some(range_id))
        {
            if existing.text_matches(text.as_deref()) {
                return Ok(());
            }
            existing.text = text;
            self.repo.update_annotation(existing)?;
            report
                .annotations_updated
                .push(AnnotationChange::of(owner, existing));
            return Ok(());
        }

        let annotation = Annotation::for_range(topic, range_id, text);
        self.repo.add_annotation(owner, &annotation)?;
        report
            .annotations_added
            .push(AnnotationChange::of(owner, &annotation));
        self.annotations.push(annotation);
        Ok(())
    }

    fn remove(&mut self, annotation_id: AnnotationId, report: &mut RangeUpdateReport) -> RepoResult<()> {
        let Some(index) = self
            .annotations
            .iter()
            .position(|annotation| annotation.id == annotation_id)
        else {
            return Ok(());
        };
        let annotation = self.annotations.remove(index);
        self.repo.remove_annotation(annotation.id)?;
        report
            .annotations_removed
            .push(AnnotationChange::of(self.owner(), &annotation));
        Ok(())
    }

    /// Drops every ledger entry describing `range_id`.
    fn clear_range(&mut self, range_id: RangeId, report: &mut RangeUpdateReport) -> RepoResult<()> {
        let ids: Vec<AnnotationId> = self
            .annotations
            .iter()
            .filter(|annotation| annotation.topic.is_range_ledger() && annotation.range_id == Some(range_id))
            .map(|annotation| annotation.id)
            .collect();
        for annotation_id in ids {
            self.remove(annotation_id, report)?;
        }
        Ok(())
    }
}
