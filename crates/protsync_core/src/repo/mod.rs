//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the record-store contract the reconciliation engine depends on.
//! - Isolate SQLite query details from reconciliation and orchestration.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors.
//! - Controlled-vocabulary terms are only resolved through
//!   [`VocabularyResolver`].

use crate::db::DbError;
use thiserror::Error;
use uuid::Uuid;

pub mod record_repo;
pub mod vocabulary_repo;

pub use record_repo::{RecordRepository, SqliteRecordRepository, XrefQuery};
pub use vocabulary_repo::{SqliteVocabulary, VocabularyResolver};

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for record persistence and query operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("invalid persisted record data: {0}")]
    InvalidData(String),
}

impl RepoError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}
