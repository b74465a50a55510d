//! Use-case services.
//!
//! # Responsibility
//! - Orchestrate registry lookups, repository calls and the reconciliation
//!   engine into per-accession and batch update APIs.
//! - Keep the CLI decoupled from engine and storage details.

pub mod report;
pub mod update_service;

pub use report::{
    write_json_lines, AccessionOutcome, AccessionStatus, BatchReport, BatchSummary, ReportError,
};
pub use update_service::{UpdateError, UpdateService};
