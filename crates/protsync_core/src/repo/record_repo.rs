//! Record repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide lookup, CRUD and move APIs over the record arena tables.
//! - Load records with their xrefs/annotations and participations with their
//!   features/ranges as owned values.
//! - Offer nested atomic scopes (SQLite savepoints) to callers.
//!
//! # Invariants
//! - Xref databases/qualifiers and annotation topics are persisted as
//!   `cv_terms` ids resolved through the injected vocabulary.
//! - Deleting a record cascades to everything it owns.
//! - Lists are returned in deterministic order (`created_at`, then id for
//!   records; insertion order for owned rows).

use crate::db::migrations::ensure_latest;
use crate::model::range::{Position, PositionStatus, Range, RangeId};
use crate::model::record::{
    Annotation, AnnotationId, AnnotationOwner, CrossReference, Feature, FeatureId, Participation,
    ParticipationId, Record, RecordId, RecordKind, XrefId,
};
use crate::model::vocabulary::{Qualifier, TermCategory, Topic};
use crate::repo::vocabulary_repo::{SqliteVocabulary, VocabularyResolver};
use crate::repo::{RepoError, RepoResult};
use log::{error, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use uuid::Uuid;

const RECORD_SELECT_SQL: &str = "SELECT
    uuid,
    kind,
    short_label,
    sequence,
    sequence_version,
    organism_taxid,
    created_at
FROM records";

/// Lookup-by-cross-reference query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrefQuery {
    pub database: String,
    /// `None` matches any qualifier.
    pub qualifier: Option<Qualifier>,
    pub primary_id: String,
}

impl XrefQuery {
    pub fn new(database: impl Into<String>, qualifier: Option<Qualifier>, primary_id: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            qualifier,
            primary_id: primary_id.into(),
        }
    }
}

/// Record store consumed by the reconciliation engine.
pub trait RecordRepository {
    /// Inserts a record with its xrefs and annotations.
    fn create_record(&self, record: &Record) -> RepoResult<RecordId>;
    /// Updates scalar record fields (label, sequence, version, organism).
    fn update_record(&self, record: &Record) -> RepoResult<()>;
    /// Deletes a record and everything it owns.
    fn delete_record(&self, id: RecordId) -> RepoResult<()>;
    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>>;
    /// Records whose `identity` xref in `database` carries `accession`.
    fn find_by_identity(&self, database: &str, accession: &str) -> RepoResult<Vec<Record>>;
    fn find_by_xref(&self, query: &XrefQuery) -> RepoResult<Vec<Record>>;
    /// Distinct accessions carried by `identity` xrefs in `database`.
    fn list_identity_accessions(&self, database: &str) -> RepoResult<Vec<String>>;

    fn add_xref(&self, record_id: RecordId, xref: &CrossReference) -> RepoResult<()>;
    fn update_xref(&self, xref: &CrossReference) -> RepoResult<()>;
    fn remove_xref(&self, xref_id: XrefId) -> RepoResult<()>;

    fn add_annotation(&self, owner: AnnotationOwner, annotation: &Annotation) -> RepoResult<()>;
    fn update_annotation(&self, annotation: &Annotation) -> RepoResult<()>;
    fn remove_annotation(&self, annotation_id: AnnotationId) -> RepoResult<()>;

    /// Inserts a participation with its features, ranges and feature annotations.
    fn create_participation(&self, participation: &Participation) -> RepoResult<ParticipationId>;
    fn list_participations(&self, record_id: RecordId) -> RepoResult<Vec<Participation>>;
    fn move_participation(&self, participation_id: ParticipationId, to: RecordId) -> RepoResult<()>;
    /// Rewrites bounds, statuses and subsequence of an existing range.
    fn update_range(&self, range: &Range) -> RepoResult<()>;

    /// Runs `work` all-or-nothing; scopes nest.
    fn atomically<T, E, F>(&self, label: &str, work: F) -> Result<T, E>
    where
        E: From<RepoError>,
        F: FnOnce() -> Result<T, E>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
    vocabulary: Box<dyn VocabularyResolver + 'conn>,
}

impl<'conn> SqliteRecordRepository<'conn> {
    /// Constructs a repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        Self::with_vocabulary(conn, Box::new(SqliteVocabulary::new(conn)))
    }

    /// Constructs a repository resolving terms through `vocabulary`.
    pub fn with_vocabulary(
        conn: &'conn Connection,
        vocabulary: Box<dyn VocabularyResolver + 'conn>,
    ) -> RepoResult<Self> {
        ensure_latest(conn)?;
        Ok(Self { conn, vocabulary })
    }

    fn term_id(&self, category: TermCategory, label: &str) -> RepoResult<i64> {
        Ok(self.vocabulary.resolve(category, label)?.id)
    }

    fn insert_xref(&self, record_id: RecordId, xref: &CrossReference) -> RepoResult<()> {
        let database_id = self.term_id(TermCategory::Database, &xref.database)?;
        let qualifier_id = self.term_id(TermCategory::Qualifier, xref.qualifier.label())?;
        self.conn.execute(
            "INSERT INTO xrefs (uuid, record_uuid, database_id, qualifier_id, primary_id, release)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                xref.id.to_string(),
                record_id.to_string(),
                database_id,
                qualifier_id,
                xref.primary_id.as_str(),
                xref.release.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn insert_annotation(&self, owner: AnnotationOwner, annotation: &Annotation) -> RepoResult<()> {
        let topic_id = self.term_id(TermCategory::Topic, annotation.topic.label())?;
        let (record_uuid, feature_uuid) = match owner {
            AnnotationOwner::Record(id) => (Some(id.to_string()), None),
            AnnotationOwner::Feature(id) => (None, Some(id.to_string())),
        };
        self.conn.execute(
            "INSERT INTO annotations (uuid, record_uuid, feature_uuid, topic_id, text, range_uuid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                annotation.id.to_string(),
                record_uuid,
                feature_uuid,
                topic_id,
                annotation.text.as_deref(),
                annotation.range_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    fn insert_range(&self, feature_id: FeatureId, ordinal: usize, range: &Range) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO ranges (
                uuid,
                feature_uuid,
                ordinal,
                start_status,
                start_min,
                start_max,
                end_status,
                end_min,
                end_max,
                sequence
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                range.id.to_string(),
                feature_id.to_string(),
                ordinal as i64,
                range.start.status.map(PositionStatus::as_str),
                range.start.min,
                range.start.max,
                range.end.status.map(PositionStatus::as_str),
                range.end.min,
                range.end.max,
                range.sequence.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn load_records(&self, sql: &str, bind_values: Vec<Value>) -> RepoResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        drop(rows);

        for record in &mut records {
            record.xrefs = self.load_xrefs(record.id)?;
            record.annotations = self.load_annotations(AnnotationOwner::Record(record.id))?;
        }
        Ok(records)
    }

    fn load_xrefs(&self, record_id: RecordId) -> RepoResult<Vec<CrossReference>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                x.uuid,
                d.short_label AS database,
                q.short_label AS qualifier,
                x.primary_id,
                x.release
             FROM xrefs x
             INNER JOIN cv_terms d ON d.id = x.database_id
             INNER JOIN cv_terms q ON q.id = x.qualifier_id
             WHERE x.record_uuid = ?1
             ORDER BY x.rowid ASC;",
        )?;
        let mut rows = stmt.query([record_id.to_string()])?;
        let mut xrefs = Vec::new();
        while let Some(row) = rows.next()? {
            let qualifier: String = row.get("qualifier")?;
            xrefs.push(CrossReference {
                id: parse_uuid(&row.get::<_, String>("uuid")?, "xrefs.uuid")?,
                database: row.get("database")?,
                qualifier: Qualifier::from_label(&qualifier),
                primary_id: row.get("primary_id")?,
                release: row.get("release")?,
            });
        }
        Ok(xrefs)
    }

    fn load_annotations(&self, owner: AnnotationOwner) -> RepoResult<Vec<Annotation>> {
        let (column, id) = match owner {
            AnnotationOwner::Record(id) => ("record_uuid", id),
            AnnotationOwner::Feature(id) => ("feature_uuid", id),
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT
                a.uuid,
                t.short_label AS topic,
                a.text,
                a.range_uuid
             FROM annotations a
             INNER JOIN cv_terms t ON t.id = a.topic_id
             WHERE a.{column} = ?1
             ORDER BY a.rowid ASC;"
        ))?;
        let mut rows = stmt.query([id.to_string()])?;
        let mut annotations = Vec::new();
        while let Some(row) = rows.next()? {
            let topic: String = row.get("topic")?;
            let range_id = match row.get::<_, Option<String>>("range_uuid")? {
                Some(value) => Some(parse_uuid(&value, "annotations.range_uuid")?),
                None => None,
            };
            annotations.push(Annotation {
                id: parse_uuid(&row.get::<_, String>("uuid")?, "annotations.uuid")?,
                topic: Topic::from_label(&topic),
                text: row.get("text")?,
                range_id,
            });
        }
        Ok(annotations)
    }

    fn load_features(&self, participation_id: ParticipationId) -> RepoResult<Vec<Feature>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, short_label
             FROM features
             WHERE participation_uuid = ?1
             ORDER BY rowid ASC;",
        )?;
        let mut rows = stmt.query([participation_id.to_string()])?;
        let mut features = Vec::new();
        while let Some(row) = rows.next()? {
            features.push(Feature {
                id: parse_uuid(&row.get::<_, String>("uuid")?, "features.uuid")?,
                participation_id,
                short_label: row.get("short_label")?,
                ranges: Vec::new(),
                annotations: Vec::new(),
            });
        }
        drop(rows);

        for feature in &mut features {
            feature.ranges = self.load_ranges(feature.id)?;
            feature.annotations = self.load_annotations(AnnotationOwner::Feature(feature.id))?;
        }
        Ok(features)
    }

    fn load_ranges(&self, feature_id: FeatureId) -> RepoResult<Vec<Range>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                uuid,
                start_status,
                start_min,
                start_max,
                end_status,
                end_min,
                end_max,
                sequence
             FROM ranges
             WHERE feature_uuid = ?1
             ORDER BY ordinal ASC, rowid ASC;",
        )?;
        let mut rows = stmt.query([feature_id.to_string()])?;
        let mut ranges = Vec::new();
        while let Some(row) = rows.next()? {
            ranges.push(parse_range_row(row)?);
        }
        Ok(ranges)
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn create_record(&self, record: &Record) -> RepoResult<RecordId> {
        self.conn.execute(
            "INSERT INTO records (
                uuid,
                kind,
                short_label,
                sequence,
                sequence_version,
                organism_taxid,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                record.id.to_string(),
                record.kind.as_str(),
                record.short_label.as_str(),
                record.sequence.as_deref(),
                record.sequence_version,
                record.organism_taxid,
                record.created_at,
            ],
        )?;

        for xref in &record.xrefs {
            self.insert_xref(record.id, xref)?;
        }
        for annotation in &record.annotations {
            self.insert_annotation(AnnotationOwner::Record(record.id), annotation)?;
        }

        Ok(record.id)
    }

    fn update_record(&self, record: &Record) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE records
             SET
                short_label = ?2,
                sequence = ?3,
                sequence_version = ?4,
                organism_taxid = ?5,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?1;",
            params![
                record.id.to_string(),
                record.short_label.as_str(),
                record.sequence.as_deref(),
                record.sequence_version,
                record.organism_taxid,
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::not_found("record", record.id));
        }
        Ok(())
    }

    fn delete_record(&self, id: RecordId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE uuid = ?1;", [id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("record", id));
        }
        Ok(())
    }

    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        let mut records = self.load_records(
            &format!("{RECORD_SELECT_SQL} WHERE uuid = ?;"),
            vec![Value::Text(id.to_string())],
        )?;
        Ok(records.pop())
    }

    fn find_by_identity(&self, database: &str, accession: &str) -> RepoResult<Vec<Record>> {
        self.find_by_xref(&XrefQuery::new(
            database,
            Some(Qualifier::Identity),
            accession,
        ))
    }

    fn find_by_xref(&self, query: &XrefQuery) -> RepoResult<Vec<Record>> {
        let Some(database) = self.vocabulary.find(TermCategory::Database, &query.database)? else {
            return Ok(Vec::new());
        };

        let mut sql = format!(
            "{RECORD_SELECT_SQL}
             WHERE uuid IN (
                SELECT x.record_uuid
                FROM xrefs x
                WHERE x.database_id = ?
                  AND x.primary_id = ? COLLATE NOCASE"
        );
        let mut bind_values = vec![
            Value::Integer(database.id),
            Value::Text(query.primary_id.clone()),
        ];

        if let Some(qualifier) = query.qualifier.as_ref() {
            let Some(term) = self.vocabulary.find(TermCategory::Qualifier, qualifier.label())? else {
                return Ok(Vec::new());
            };
            sql.push_str(" AND x.qualifier_id = ?");
            bind_values.push(Value::Integer(term.id));
        }
        sql.push_str(") ORDER BY created_at ASC, uuid ASC;");

        self.load_records(&sql, bind_values)
    }

    fn list_identity_accessions(&self, database: &str) -> RepoResult<Vec<String>> {
        let (Some(database), Some(identity)) = (
            self.vocabulary.find(TermCategory::Database, database)?,
            self.vocabulary
                .find(TermCategory::Qualifier, Qualifier::Identity.label())?,
        ) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT primary_id
             FROM xrefs
             WHERE database_id = ?1
               AND qualifier_id = ?2
             ORDER BY primary_id ASC;",
        )?;
        let mut rows = stmt.query(params![database.id, identity.id])?;
        let mut accessions = Vec::new();
        while let Some(row) = rows.next()? {
            accessions.push(row.get(0)?);
        }
        Ok(accessions)
    }

    fn add_xref(&self, record_id: RecordId, xref: &CrossReference) -> RepoResult<()> {
        self.insert_xref(record_id, xref)
    }

    fn update_xref(&self, xref: &CrossReference) -> RepoResult<()> {
        let database_id = self.term_id(TermCategory::Database, &xref.database)?;
        let qualifier_id = self.term_id(TermCategory::Qualifier, xref.qualifier.label())?;
        let changed = self.conn.execute(
            "UPDATE xrefs
             SET database_id = ?2, qualifier_id = ?3, primary_id = ?4, release = ?5
             WHERE uuid = ?1;",
            params![
                xref.id.to_string(),
                database_id,
                qualifier_id,
                xref.primary_id.as_str(),
                xref.release.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("xref", xref.id));
        }
        Ok(())
    }

    fn remove_xref(&self, xref_id: XrefId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM xrefs WHERE uuid = ?1;", [xref_id.to_string()])?;
        if changed == 0 {
            return Err(RepoError::not_found("xref", xref_id));
        }
        Ok(())
    }

    fn add_annotation(&self, owner: AnnotationOwner, annotation: &Annotation) -> RepoResult<()> {
        self.insert_annotation(owner, annotation)
    }

    fn update_annotation(&self, annotation: &Annotation) -> RepoResult<()> {
        let topic_id = self.term_id(TermCategory::Topic, annotation.topic.label())?;
        let changed = self.conn.execute(
            "UPDATE annotations
             SET topic_id = ?2, text = ?3, range_uuid = ?4
             WHERE uuid = ?1;",
            params![
                annotation.id.to_string(),
                topic_id,
                annotation.text.as_deref(),
                annotation.range_id.map(|id| id.to_string()),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("annotation", annotation.id));
        }
        Ok(())
    }

    fn remove_annotation(&self, annotation_id: AnnotationId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM annotations WHERE uuid = ?1;",
            [annotation_id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("annotation", annotation_id));
        }
        Ok(())
    }

    fn create_participation(&self, participation: &Participation) -> RepoResult<ParticipationId> {
        self.conn.execute(
            "INSERT INTO participations (uuid, record_uuid, interaction_ac) VALUES (?1, ?2, ?3);",
            params![
                participation.id.to_string(),
                participation.record_id.to_string(),
                participation.interaction_ac.as_str(),
            ],
        )?;

        for feature in &participation.features {
            self.conn.execute(
                "INSERT INTO features (uuid, participation_uuid, short_label) VALUES (?1, ?2, ?3);",
                params![
                    feature.id.to_string(),
                    participation.id.to_string(),
                    feature.short_label.as_str(),
                ],
            )?;
            for (ordinal, range) in feature.ranges.iter().enumerate() {
                self.insert_range(feature.id, ordinal, range)?;
            }
            for annotation in &feature.annotations {
                self.insert_annotation(AnnotationOwner::Feature(feature.id), annotation)?;
            }
        }

        Ok(participation.id)
    }

    fn list_participations(&self, record_id: RecordId) -> RepoResult<Vec<Participation>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, interaction_ac
             FROM participations
             WHERE record_uuid = ?1
             ORDER BY rowid ASC;",
        )?;
        let mut rows = stmt.query([record_id.to_string()])?;
        let mut participations = Vec::new();
        while let Some(row) = rows.next()? {
            participations.push(Participation {
                id: parse_uuid(&row.get::<_, String>("uuid")?, "participations.uuid")?,
                record_id,
                interaction_ac: row.get("interaction_ac")?,
                features: Vec::new(),
            });
        }
        drop(rows);

        for participation in &mut participations {
            participation.features = self.load_features(participation.id)?;
        }
        Ok(participations)
    }

    fn move_participation(&self, participation_id: ParticipationId, to: RecordId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE participations SET record_uuid = ?2 WHERE uuid = ?1;",
            params![participation_id.to_string(), to.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("participation", participation_id));
        }
        Ok(())
    }

    fn update_range(&self, range: &Range) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE ranges
             SET
                start_status = ?2,
                start_min = ?3,
                start_max = ?4,
                end_status = ?5,
                end_min = ?6,
                end_max = ?7,
                sequence = ?8
             WHERE uuid = ?1;",
            params![
                range.id.to_string(),
                range.start.status.map(PositionStatus::as_str),
                range.start.min,
                range.start.max,
                range.end.status.map(PositionStatus::as_str),
                range.end.min,
                range.end.max,
                range.sequence.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::not_found("range", range.id));
        }
        Ok(())
    }

    fn atomically<T, E, F>(&self, label: &str, work: F) -> Result<T, E>
    where
        E: From<RepoError>,
        F: FnOnce() -> Result<T, E>,
    {
        let name = savepoint_name(label);
        self.conn
            .execute_batch(&format!("SAVEPOINT {name};"))
            .map_err(|err| E::from(RepoError::from(err)))?;

        match work() {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE {name};"))
                    .map_err(|err| E::from(RepoError::from(err)))?;
                Ok(value)
            }
            Err(err) => {
                warn!("event=scope_rollback module=repo status=rollback scope={name}");
                if let Err(rollback_err) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))
                {
                    error!(
                        "event=scope_rollback module=repo status=error scope={name} error={rollback_err}"
                    );
                }
                Err(err)
            }
        }
    }
}

fn savepoint_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    format!("sp_{sanitized}")
}

fn parse_record_row(row: &Row<'_>) -> RepoResult<Record> {
    let uuid_text: String = row.get("uuid")?;
    let kind_text: String = row.get("kind")?;
    let kind = RecordKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid record kind `{kind_text}` in records.kind"))
    })?;

    Ok(Record {
        id: parse_uuid(&uuid_text, "records.uuid")?,
        kind,
        short_label: row.get("short_label")?,
        sequence: row.get("sequence")?,
        sequence_version: row.get("sequence_version")?,
        organism_taxid: row.get("organism_taxid")?,
        created_at: row.get("created_at")?,
        xrefs: Vec::new(),
        annotations: Vec::new(),
    })
}

fn parse_range_row(row: &Row<'_>) -> RepoResult<Range> {
    let id: RangeId = parse_uuid(&row.get::<_, String>("uuid")?, "ranges.uuid")?;
    let start_status = parse_position_status(row.get("start_status")?, "ranges.start_status")?;
    let end_status = parse_position_status(row.get("end_status")?, "ranges.end_status")?;

    Ok(Range {
        id,
        start: Position {
            status: start_status,
            min: row.get("start_min")?,
            max: row.get("start_max")?,
        },
        end: Position {
            status: end_status,
            min: row.get("end_min")?,
            max: row.get("end_max")?,
        },
        sequence: row.get("sequence")?,
    })
}

fn parse_position_status(
    value: Option<String>,
    column: &str,
) -> RepoResult<Option<PositionStatus>> {
    match value {
        Some(text) => PositionStatus::parse(&text).map(Some).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid position status `{text}` in {column}"))
        }),
        None => Ok(None),
    }
}

fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}
