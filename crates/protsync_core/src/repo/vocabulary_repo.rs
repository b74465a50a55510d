//! Controlled-vocabulary resolution.
//!
//! # Responsibility
//! - Resolve (category, short label) pairs to persisted `cv_terms` rows,
//!   creating missing terms on first use.
//!
//! # Invariants
//! - Labels are stored lowercase; lookups are case-insensitive.
//! - One row per (category, label); concurrent creates collapse to one row.

use crate::model::vocabulary::{CvTerm, TermCategory};
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};

/// Lookup-or-create capability for controlled-vocabulary terms.
pub trait VocabularyResolver {
    /// Returns the term for `short_label`, creating it when missing.
    fn resolve(&self, category: TermCategory, short_label: &str) -> RepoResult<CvTerm>;
    /// Returns the term when it already exists, without creating it.
    fn find(&self, category: TermCategory, short_label: &str) -> RepoResult<Option<CvTerm>>;
}

/// SQLite-backed vocabulary over the `cv_terms` table.
pub struct SqliteVocabulary<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteVocabulary<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl VocabularyResolver for SqliteVocabulary<'_> {
    fn resolve(&self, category: TermCategory, short_label: &str) -> RepoResult<CvTerm> {
        let label = normalize_label(short_label)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO cv_terms (category, short_label) VALUES (?1, ?2);",
            params![category.as_str(), label.as_str()],
        )?;

        self.find(category, &label)?.ok_or_else(|| {
            RepoError::InvalidData(format!(
                "vocabulary term `{label}` ({}) vanished after insert",
                category.as_str()
            ))
        })
    }

    fn find(&self, category: TermCategory, short_label: &str) -> RepoResult<Option<CvTerm>> {
        let label = normalize_label(short_label)?;
        let id = self
            .conn
            .query_row(
                "SELECT id FROM cv_terms WHERE category = ?1 AND short_label = ?2;",
                params![category.as_str(), label.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(id.map(|id| CvTerm {
            id,
            category,
            short_label: label,
        }))
    }
}

fn normalize_label(value: &str) -> RepoResult<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(RepoError::InvalidData(
            "vocabulary label must not be blank".to_string(),
        ));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::{SqliteVocabulary, VocabularyResolver};
    use crate::db::open_db_in_memory;
    use crate::model::vocabulary::TermCategory;

    #[test]
    fn resolve_creates_once_and_is_case_insensitive() {
        let conn = open_db_in_memory().unwrap();
        let vocabulary = SqliteVocabulary::new(&conn);

        let first = vocabulary.resolve(TermCategory::Topic, "Caution").unwrap();
        let second = vocabulary.resolve(TermCategory::Topic, "caution").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.short_label, "caution");

        let other_category = vocabulary
            .resolve(TermCategory::Qualifier, "caution")
            .unwrap();
        assert_ne!(first.id, other_category.id);
    }

    #[test]
    fn find_does_not_create() {
        let conn = open_db_in_memory().unwrap();
        let vocabulary = SqliteVocabulary::new(&conn);

        assert!(vocabulary
            .find(TermCategory::Database, "uniprotkb")
            .unwrap()
            .is_none());
        assert!(vocabulary.resolve(TermCategory::Database, "  ").is_err());
    }
}
