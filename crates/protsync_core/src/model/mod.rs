//! Domain model for curated protein records.
//!
//! # Responsibility
//! - Define the id-keyed entities the reconciliation engine reads and writes.
//! - Keep the controlled vocabulary in one place.
//!
//! # Invariants
//! - Entities reference each other by id; there are no back-pointers.
//! - Ranges are mutated in place and never deleted by the engine.

pub mod range;
pub mod record;
pub mod vocabulary;
