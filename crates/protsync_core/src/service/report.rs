//! Audit records produced by update runs.
//!
//! # Responsibility
//! - Collect everything one accession's processing changed or refused.
//! - Serialize batch results as JSON lines for the audit collaborator.

use crate::model::record::RecordId;
use crate::reconcile::{
    IdentityConflict, MergeReport, PromotionOutcome, RangeUpdateReport, RetirementReport,
};
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessionStatus {
    /// Records were changed to follow the registry.
    Updated,
    /// Records already matched the registry.
    Unchanged,
    /// The accession was withdrawn and its records retired.
    Dead,
    /// Nothing could be processed (no records or an ambiguous accession).
    Skipped,
    /// The accession's transaction was rolled back.
    Failed,
}

/// Everything one accession's processing did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessionOutcome {
    pub accession: String,
    /// Primary accession the registry resolved `accession` to.
    pub resolved_accession: Option<String>,
    pub status: AccessionStatus,
    pub created: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
    pub promotions: Vec<PromotionOutcome>,
    pub retirements: Vec<RetirementReport>,
    pub merges: Vec<MergeReport>,
    pub range_reports: Vec<RangeUpdateReport>,
    pub conflicts: Vec<IdentityConflict>,
    pub errors: Vec<String>,
}

impl AccessionOutcome {
    pub fn new(accession: impl Into<String>) -> Self {
        Self {
            accession: accession.into(),
            resolved_accession: None,
            status: AccessionStatus::Unchanged,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            promotions: Vec::new(),
            retirements: Vec::new(),
            merges: Vec::new(),
            range_reports: Vec::new(),
            conflicts: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn failed(accession: impl Into<String>, error: impl Into<String>) -> Self {
        let mut outcome = Self::new(accession);
        outcome.status = AccessionStatus::Failed;
        outcome.errors.push(error.into());
        outcome
    }

    pub fn has_changes(&self) -> bool {
        !self.created.is_empty()
            || !self.updated.is_empty()
            || !self.deleted.is_empty()
            || !self.merges.is_empty()
            || !self.range_reports.is_empty()
            || self
                .promotions
                .iter()
                .any(|promotion| matches!(promotion, PromotionOutcome::Promoted { .. }))
            || self.retirements.iter().any(|retirement| !retirement.is_noop())
    }

    pub(crate) fn mark_updated(&mut self, record_id: RecordId) {
        if !self.updated.contains(&record_id) {
            self.updated.push(record_id);
        }
    }
}

/// Per-status counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub dead: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<AccessionOutcome>,
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            processed: self.outcomes.len(),
            ..BatchSummary::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                AccessionStatus::Updated => summary.updated += 1,
                AccessionStatus::Unchanged => summary.unchanged += 1,
                AccessionStatus::Dead => summary.dead += 1,
                AccessionStatus::Skipped => summary.skipped += 1,
                AccessionStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes one JSON object per line for each item.
pub fn write_json_lines<W, T>(writer: &mut W, items: &[T]) -> Result<(), ReportError>
where
    W: Write,
    T: Serialize,
{
    for item in items {
        serde_json::to_writer(&mut *writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
