//! Registry update orchestration.
//!
//! # Responsibility
//! - Build the resolution case of one accession and drive identity
//!   transitions, duplicate merge, range reconciliation and sequence update
//!   for masters and their transcripts.
//! - Run batches of accessions, isolating failures per accession.
//!
//! # Invariants
//! - One accession is processed inside one savepoint; a repository failure
//!   rolls back that accession only.
//! - A failing record step rolls back that step only and is reported in
//!   `AccessionOutcome::errors`.
//! - Merge runs before the survivor's own ranges are reconciled.
//! - Records tagged `no-longer-synced` never enter a resolution case.

use crate::model::record::{Participation, ParticipationId, Record, RecordId, RecordKind};
use crate::reconcile::{
    group, ConflictKind, DuplicateCandidate, EngineSettings, IdentityConflict,
    IdentityTransitionHandler, MergeEngine, PromotionOutcome, PromotionRequest,
    RangeReconciler, RangeUpdateReport, ReconcileError, RetirementReport,
};
use crate::registry::{
    ArchiveError, RegistryClient, RegistryEntry, RegistryError, RegistryLookup, SequenceArchive,
};
use crate::repo::{RecordRepository, RepoError, XrefQuery};
use crate::service::report::{AccessionOutcome, AccessionStatus, BatchReport};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Per-accession synchronization of curated records with the registry.
pub struct UpdateService<'a, R, C: ?Sized, A: ?Sized> {
    repo: &'a R,
    registry: &'a C,
    archive: &'a A,
    settings: &'a EngineSettings,
}

impl<'a, R, C, A> UpdateService<'a, R, C, A>
where
    R: RecordRepository,
    C: RegistryClient + ?Sized,
    A: SequenceArchive + ?Sized,
{
    pub fn new(repo: &'a R, registry: &'a C, archive: &'a A, settings: &'a EngineSettings) -> Self {
        Self {
            repo,
            registry,
            archive,
            settings,
        }
    }

    /// Accessions identifying at least one synchronized master record.
    pub fn tracked_accessions(&self) -> Result<Vec<String>, UpdateError> {
        let mut tracked = Vec::new();
        for accession in self
            .repo
            .list_identity_accessions(&self.settings.registry_database)?
        {
            if !self.sync_candidates(&accession)?.is_empty() {
                tracked.push(accession);
            }
        }
        Ok(tracked)
    }

    /// Processes each accession in order; a failing accession is reported
    /// and the batch continues.
    pub fn run_batch(&self, accessions: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for accession in accessions {
            let outcome = match self.process_accession(accession) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(
                        "event=process_accession module=service status=error accession={accession} error={err}"
                    );
                    AccessionOutcome::failed(accession.as_str(), err.to_string())
                }
            };
            report.outcomes.push(outcome);
        }

        let summary = report.summary();
        info!(
            "event=run_batch module=service status=ok processed={} updated={} dead={} skipped={} failed={}",
            summary.processed, summary.updated, summary.dead, summary.skipped, summary.failed
        );
        report
    }

    /// Synchronizes every record of `accession` with the registry.
    pub fn process_accession(&self, accession: &str) -> Result<AccessionOutcome, UpdateError> {
        let accession = accession.trim();
        let lookup = self.registry.resolve(accession)?;

        self.repo.atomically("accession", || {
            let mut outcome = AccessionOutcome::new(accession);
            match lookup {
                RegistryLookup::Found(entry) => self.process_found(accession, &entry, &mut outcome)?,
                RegistryLookup::NotFound => self.process_dead(accession, &mut outcome)?,
                RegistryLookup::Ambiguous(candidates) => {
                    warn!(
                        "event=process_accession module=service status=skip accession={accession} reason=ambiguous candidates={}",
                        candidates.len()
                    );
                    outcome.conflicts.push(IdentityConflict {
                        record_id: None,
                        accession: accession.to_string(),
                        message: format!(
                            "{accession} is secondary to several registry entries: {}",
                            candidates.join(", ")
                        ),
                        kind: ConflictKind::AmbiguousAccession { candidates },
                    });
                    outcome.status = AccessionStatus::Skipped;
                }
            }
            Ok::<_, UpdateError>(outcome)
        })
    }

    /// Retires one record regardless of what the registry says.
    pub fn retire_record(&self, record_id: RecordId) -> Result<RetirementReport, UpdateError> {
        let record = self
            .repo
            .get_record(record_id)?
            .ok_or_else(|| RepoError::not_found("record", record_id))?;
        let handler = IdentityTransitionHandler::new(self.repo, self.settings);
        self.repo
            .atomically("retire", || Ok(handler.retire_dead(&record)?))
    }

    fn process_dead(&self, accession: &str, outcome: &mut AccessionOutcome) -> Result<(), UpdateError> {
        let masters = self.sync_candidates(accession)?;
        if masters.is_empty() {
            outcome.status = AccessionStatus::Skipped;
            return Ok(());
        }

        let handler = IdentityTransitionHandler::new(self.repo, self.settings);
        for master in &masters {
            let mut doomed = vec![master.clone()];
            for kind in [RecordKind::Isoform, RecordKind::FeatureChain] {
                doomed.extend(self.transcripts_of(master.id, kind)?);
            }
            for record in doomed {
                if let Some(retirement) = self.guarded("retire", record.id, &mut outcome.errors, || {
                    Ok(handler.retire_dead(&record)?)
                }) {
                    if !retirement.is_noop() {
                        outcome.mark_updated(record.id);
                    }
                    outcome.retirements.push(retirement);
                }
            }
        }

        outcome.status = AccessionStatus::Dead;
        info!(
            "event=process_accession module=service status=ok accession={accession} outcome=dead retired={}",
            outcome.retirements.len()
        );
        Ok(())
    }

    fn process_found(
        &self,
        accession: &str,
        entry: &RegistryEntry,
        outcome: &mut AccessionOutcome,
    ) -> Result<(), UpdateError> {
        outcome.resolved_accession = Some(entry.accession.clone());

        let mut seen = HashSet::new();
        let mut masters: Vec<Record> = self
            .sync_candidates(&entry.accession)?
            .into_iter()
            .filter(|record| seen.insert(record.id))
            .collect();

        let mut secondary_acs: Vec<&str> = entry
            .secondary_accessions
            .iter()
            .map(String::as_str)
            .collect();
        if !accession.eq_ignore_ascii_case(&entry.accession) {
            secondary_acs.push(accession);
        }
        let mut secondaries = Vec::new();
        for secondary_ac in secondary_acs {
            for record in self.sync_candidates(secondary_ac)? {
                if seen.insert(record.id) {
                    secondaries.push(record);
                }
            }
        }

        let handler = IdentityTransitionHandler::new(self.repo, self.settings);
        let request = PromotionRequest {
            new_primary_ac: entry.accession.clone(),
            release: entry.release.clone(),
            organism_taxid: entry.organism_taxid,
        };
        for record in secondaries {
            let Some(promotion) = self.guarded("promote", record.id, &mut outcome.errors, || {
                Ok(handler.promote_secondary(&record, &request)?)
            }) else {
                continue;
            };
            match &promotion {
                PromotionOutcome::Promoted { record_id, .. } => {
                    outcome.mark_updated(*record_id);
                    masters.push(record);
                }
                PromotionOutcome::Unchanged { .. } => masters.push(record),
                PromotionOutcome::Conflict(conflict) => outcome.conflicts.push(conflict.clone()),
            }
            outcome.promotions.push(promotion);
        }

        if masters.is_empty() {
            outcome.status = AccessionStatus::Skipped;
            return Ok(());
        }

        let survivors = self.merge_kind(&masters, RecordKind::Protein, Some(&entry.sequence), outcome)?;
        for survivor in survivors {
            let survivor_id = survivor.record_id;
            let update = self.guarded("sequence", survivor_id, &mut outcome.errors, || {
                self.update_sequence(
                    &survivor,
                    Some(entry.sequence.as_str()),
                    entry.sequence_version,
                    entry.release.as_deref(),
                    entry.organism_taxid,
                )
            });
            if let Some(update) = update {
                update.apply(survivor_id, outcome);
            }

            for kind in [RecordKind::Isoform, RecordKind::FeatureChain] {
                self.process_transcripts(survivor_id, kind, entry, outcome)?;
            }
        }

        outcome.status = if outcome.has_changes() {
            AccessionStatus::Updated
        } else {
            AccessionStatus::Unchanged
        };
        info!(
            "event=process_accession module=service status=ok accession={accession} resolved={} outcome={:?} errors={}",
            entry.accession,
            outcome.status,
            outcome.errors.len()
        );
        Ok(())
    }

    fn process_transcripts(
        &self,
        master_id: RecordId,
        kind: RecordKind,
        entry: &RegistryEntry,
        outcome: &mut AccessionOutcome,
    ) -> Result<(), UpdateError> {
        let handler = IdentityTransitionHandler::new(self.repo, self.settings);
        let mut matched: BTreeMap<String, Vec<Record>> = BTreeMap::new();

        for transcript in self.transcripts_of(master_id, kind)? {
            let registry_transcript = transcript
                .identity_accession(&self.settings.registry_database)
                .and_then(|accession| entry.transcript(accession, kind));
            match registry_transcript {
                Some(registry_transcript) => matched
                    .entry(registry_transcript.accession.to_ascii_uppercase())
                    .or_default()
                    .push(transcript),
                None => {
                    if let Some(retirement) =
                        self.guarded("retire", transcript.id, &mut outcome.errors, || {
                            Ok(handler.retire_dead(&transcript)?)
                        })
                    {
                        if !retirement.is_noop() {
                            outcome.mark_updated(transcript.id);
                        }
                        outcome.retirements.push(retirement);
                    }
                }
            }
        }

        for (transcript_ac, records) in matched {
            let Some(registry_transcript) = entry.transcript(&transcript_ac, kind) else {
                continue;
            };
            let sequence = registry_transcript.sequence.as_deref();
            for survivor in self.merge_kind(&records, kind, sequence, outcome)? {
                let Some(sequence) = sequence else {
                    continue;
                };
                let survivor_id = survivor.record_id;
                let update = self.guarded("sequence", survivor_id, &mut outcome.errors, || {
                    self.update_sequence(
                        &survivor,
                        Some(sequence),
                        registry_transcript.sequence_version,
                        entry.release.as_deref(),
                        None,
                    )
                });
                if let Some(update) = update {
                    update.apply(survivor_id, outcome);
                }
            }
        }
        Ok(())
    }

    /// Groups `records` and merges each group; returns the survivors.
    fn merge_kind(
        &self,
        records: &[Record],
        kind: RecordKind,
        target_sequence: Option<&str>,
        outcome: &mut AccessionOutcome,
    ) -> Result<Vec<Survivor>, UpdateError> {
        let candidates: Vec<DuplicateCandidate> = records
            .iter()
            .map(|record| DuplicateCandidate::from_record(record, &self.settings.registry_database))
            .collect();
        let engine = MergeEngine::new(self.repo, self.archive, self.settings);
        let mut survivors = Vec::new();

        for equivalence in group(&candidates, kind) {
            if !equivalence.needs_merge() {
                survivors.extend(equivalence.members.first().map(|record_id| Survivor {
                    record_id: *record_id,
                    merged_in: HashSet::new(),
                }));
                continue;
            }
            match engine.merge(&equivalence, target_sequence) {
                Ok(report) => {
                    survivors.push(Survivor {
                        record_id: report.survivor_id,
                        merged_in: report.moved_participations.iter().copied().collect(),
                    });
                    outcome.created.extend(report.residual_ids());
                    outcome.deleted.extend(report.removed_ids());
                    outcome.mark_updated(report.survivor_id);
                    outcome.merges.push(report);
                }
                Err(err) => {
                    warn!(
                        "event=merge_group module=service status=error kind={} members={} error={err}",
                        kind.as_str(),
                        equivalence.members.len()
                    );
                    outcome.errors.push(format!(
                        "merge of {} {} records failed: {err}",
                        equivalence.members.len(),
                        kind.as_str()
                    ));
                }
            }
        }
        Ok(survivors)
    }

    /// Moves the survivor to the registry sequence, remapping the ranges of
    /// the participations it owned before any merge.
    fn update_sequence(
        &self,
        survivor: &Survivor,
        sequence: Option<&str>,
        sequence_version: Option<u32>,
        release: Option<&str>,
        organism_taxid: Option<i32>,
    ) -> Result<SequenceUpdate, UpdateError> {
        let record_id = survivor.record_id;
        let mut record = self
            .repo
            .get_record(record_id)?
            .ok_or_else(|| RepoError::not_found("record", record_id))?;
        let own = self.own_participations(&record, &survivor.merged_in)?;

        let reconciler = RangeReconciler::new(self.repo, self.archive, self.settings);
        let range_report =
            reconciler.reconcile_participations(&record, &own, record.sequence.as_deref(), sequence)?;

        let mut changed = false;
        if sequence.is_some() && record.sequence.as_deref() != sequence {
            record.sequence = sequence.map(str::to_string);
            changed = true;
        }
        if sequence_version.is_some() && record.sequence_version != sequence_version {
            record.sequence_version = sequence_version;
            changed = true;
        }
        if record.organism_taxid.is_none() && organism_taxid.is_some() {
            record.organism_taxid = organism_taxid;
            changed = true;
        }
        if changed {
            self.repo.update_record(&record)?;
        }

        if let Some(identity) = record.identity_xref(&self.settings.registry_database) {
            if release.is_some() && identity.release.as_deref() != release {
                let mut refreshed = identity.clone();
                refreshed.release = release.map(str::to_string);
                self.repo.update_xref(&refreshed)?;
                changed = true;
            }
        }

        Ok(SequenceUpdate {
            changed,
            range_report: (!range_report.is_empty()).then_some(range_report),
        })
    }

    /// Participations whose ranges still refer to the record's own
    /// sequence; those that arrived through a merge are already mapped onto
    /// the registry sequence.
    fn own_participations(
        &self,
        record: &Record,
        merged_in: &HashSet<ParticipationId>,
    ) -> Result<Vec<Participation>, UpdateError> {
        Ok(self
            .repo
            .list_participations(record.id)?
            .into_iter()
            .filter(|participation| !merged_in.contains(&participation.id))
            .collect())
    }

    /// Master records carrying `accession` as identity, minus excluded ones.
    fn sync_candidates(&self, accession: &str) -> Result<Vec<Record>, UpdateError> {
        Ok(self
            .repo
            .find_by_identity(&self.settings.registry_database, accession)?
            .into_iter()
            .filter(|record| record.kind == RecordKind::Protein && !record.is_sync_excluded())
            .collect())
    }

    fn transcripts_of(&self, master_id: RecordId, kind: RecordKind) -> Result<Vec<Record>, UpdateError> {
        let Some(qualifier) = kind.parent_qualifier() else {
            return Ok(Vec::new());
        };
        let query = XrefQuery::new(
            self.settings.local_database.clone(),
            Some(qualifier),
            master_id.to_string(),
        );
        Ok(self
            .repo
            .find_by_xref(&query)?
            .into_iter()
            .filter(|record| record.kind == kind && !record.is_sync_excluded())
            .collect())
    }

    /// Runs one record step in its own savepoint, capturing its failure.
    fn guarded<T>(
        &self,
        step: &str,
        subject: impl Display,
        errors: &mut Vec<String>,
        work: impl FnOnce() -> Result<T, UpdateError>,
    ) -> Option<T> {
        match self.repo.atomically(step, work) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("event=record_step module=service status=error step={step} record={subject} error={err}");
                errors.push(format!("{step} {subject}: {err}"));
                None
            }
        }
    }
}

/// Record left standing after its group merged.
struct Survivor {
    record_id: RecordId,
    /// Participations moved onto it by the merge.
    merged_in: HashSet<ParticipationId>,
}

struct SequenceUpdate {
    changed: bool,
    range_report: Option<RangeUpdateReport>,
}

impl SequenceUpdate {
    fn apply(self, record_id: RecordId, outcome: &mut AccessionOutcome) {
        if self.changed {
            outcome.mark_updated(record_id);
        }
        if let Some(range_report) = self.range_report {
            outcome.range_reports.push(range_report);
        }
    }
}
