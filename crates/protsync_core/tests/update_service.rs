use protsync_core::db::open_db_in_memory;
use protsync_core::model::range::{Position, Range};
use protsync_core::model::record::{
    Annotation, AnnotationId, AnnotationOwner, CrossReference, Feature, Participation,
    ParticipationId, Record, RecordId, RecordKind, XrefId,
};
use protsync_core::model::vocabulary::{Qualifier, Topic};
use protsync_core::reconcile::{ConflictKind, EngineSettings, PromotionOutcome};
use protsync_core::registry::{
    RegistryClient, RegistryEntry, RegistryError, RegistryLookup, RegistryTranscript,
    SnapshotArchive, SnapshotRegistry,
};
use protsync_core::repo::{RecordRepository, RepoError, RepoResult, SqliteRecordRepository, XrefQuery};
use protsync_core::service::{AccessionStatus, UpdateError, UpdateService};

fn entry(accession: &str, sequence: &str, version: u32) -> RegistryEntry {
    RegistryEntry {
        accession: accession.to_string(),
        secondary_accessions: Vec::new(),
        organism_taxid: None,
        sequence: sequence.to_string(),
        sequence_version: Some(version),
        release: None,
        transcripts: Vec::new(),
    }
}

fn protein(accession: &str, created_at: i64, sequence: &str) -> Record {
    let mut record = Record::with_created_at(RecordKind::Protein, accession.to_lowercase(), created_at);
    record.sequence = Some(sequence.to_string());
    record.sequence_version = Some(1);
    record
        .xrefs
        .push(CrossReference::new("uniprotkb", Qualifier::Identity, accession));
    record
}

fn isoform(accession: &str, master: &Record, sequence: &str) -> Record {
    let mut record = Record::with_created_at(RecordKind::Isoform, accession.to_lowercase(), master.created_at + 1);
    record.sequence = Some(sequence.to_string());
    record.xrefs.extend([
        CrossReference::new("uniprotkb", Qualifier::Identity, accession),
        CrossReference::new("intact", Qualifier::IsoformParent, master.id.to_string()),
    ]);
    record
}

fn attach(repo: &SqliteRecordRepository<'_>, record: &Record, range: Range) -> Participation {
    let participation = Participation::new(record.id, "EBI-1")
        .with_feature(Feature::new("region").with_range(range));
    repo.create_participation(&participation).unwrap();
    participation
}

/// Registry that is unreachable for one accession.
struct FlakyRegistry {
    inner: SnapshotRegistry,
    broken: &'static str,
}

impl RegistryClient for FlakyRegistry {
    fn resolve(&self, accession: &str) -> Result<RegistryLookup, RegistryError> {
        if accession == self.broken {
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }
        self.inner.resolve(accession)
    }
}

/// Repository that loses one record between listing and loading it.
struct VanishingRecord<'conn> {
    inner: SqliteRecordRepository<'conn>,
    vanished: RecordId,
}

impl RecordRepository for VanishingRecord<'_> {
    fn create_record(&self, record: &Record) -> RepoResult<RecordId> {
        self.inner.create_record(record)
    }
    fn update_record(&self, record: &Record) -> RepoResult<()> {
        self.inner.update_record(record)
    }
    fn delete_record(&self, id: RecordId) -> RepoResult<()> {
        self.inner.delete_record(id)
    }
    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        if id == self.vanished {
            return Ok(None);
        }
        self.inner.get_record(id)
    }
    fn find_by_identity(&self, database: &str, accession: &str) -> RepoResult<Vec<Record>> {
        self.inner.find_by_identity(database, accession)
    }
    fn find_by_xref(&self, query: &XrefQuery) -> RepoResult<Vec<Record>> {
        self.inner.find_by_xref(query)
    }
    fn list_identity_accessions(&self, database: &str) -> RepoResult<Vec<String>> {
        self.inner.list_identity_accessions(database)
    }
    fn add_xref(&self, record_id: RecordId, xref: &CrossReference) -> RepoResult<()> {
        self.inner.add_xref(record_id, xref)
    }
    fn update_xref(&self, xref: &CrossReference) -> RepoResult<()> {
        self.inner.update_xref(xref)
    }
    fn remove_xref(&self, xref_id: XrefId) -> RepoResult<()> {
        self.inner.remove_xref(xref_id)
    }
    fn add_annotation(&self, owner: AnnotationOwner, annotation: &Annotation) -> RepoResult<()> {
        self.inner.add_annotation(owner, annotation)
    }
    fn update_annotation(&self, annotation: &Annotation) -> RepoResult<()> {
        self.inner.update_annotation(annotation)
    }
    fn remove_annotation(&self, annotation_id: AnnotationId) -> RepoResult<()> {
        self.inner.remove_annotation(annotation_id)
    }
    fn create_participation(&self, participation: &Participation) -> RepoResult<ParticipationId> {
        self.inner.create_participation(participation)
    }
    fn list_participations(&self, record_id: RecordId) -> RepoResult<Vec<Participation>> {
        self.inner.list_participations(record_id)
    }
    fn move_participation(&self, participation_id: ParticipationId, to: RecordId) -> RepoResult<()> {
        self.inner.move_participation(participation_id, to)
    }
    fn update_range(&self, range: &Range) -> RepoResult<()> {
        self.inner.update_range(range)
    }
    fn atomically<T, E, F>(&self, label: &str, work: F) -> Result<T, E>
    where
        E: From<RepoError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.inner.atomically(label, work)
    }
}

#[test]
fn sequence_update_shifts_ranges_and_refreshes_record() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let record = protein("P12345", 1, "ABCDE");
    repo.create_record(&record).unwrap();
    attach(&repo, &record, Range::certain(2, 3));

    let mut current = entry("P12345", "ABXCDE", 2);
    current.release = Some("2024_02".to_string());
    current.organism_taxid = Some(9606);
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Updated);
    assert_eq!(outcome.updated, vec![record.id]);
    assert_eq!(outcome.range_reports.len(), 1);
    assert!(outcome.errors.is_empty());

    let stored = repo.get_record(record.id).unwrap().unwrap();
    assert_eq!(stored.sequence.as_deref(), Some("ABXCDE"));
    assert_eq!(stored.sequence_version, Some(2));
    assert_eq!(stored.organism_taxid, Some(9606));
    assert_eq!(
        stored.identity_xref("uniprotkb").unwrap().release.as_deref(),
        Some("2024_02")
    );
    let range = &repo.list_participations(record.id).unwrap()[0].features[0].ranges[0];
    assert_eq!(range.start, Position::certain(3));
    assert_eq!(range.sequence.as_deref(), Some("CD"));
}

#[test]
fn matching_record_is_unchanged() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let record = protein("P12345", 1, "MKVLAAGIV");
    repo.create_record(&record).unwrap();
    attach(&repo, &record, Range::certain(0, 2));
    let registry = SnapshotRegistry::from_entries([entry("P12345", "MKVLAAGIV", 1)]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Unchanged);
    assert!(!outcome.has_changes());
    assert_eq!(repo.get_record(record.id).unwrap().unwrap(), record);
}

#[test]
fn withdrawn_accession_retires_master_and_transcripts() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let master = protein("P99999", 1, "MKV");
    let variant = isoform("P99999-2", &master, "MK");
    repo.create_record(&master).unwrap();
    repo.create_record(&variant).unwrap();
    let registry = SnapshotRegistry::default();

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P99999")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Dead);
    assert_eq!(outcome.retirements.len(), 2);
    for id in [master.id, variant.id] {
        let retired = repo.get_record(id).unwrap().unwrap();
        assert!(retired.is_sync_excluded());
        assert!(retired.identity_xref("uniprotkb").is_none());
    }
    let retired_variant = repo.get_record(variant.id).unwrap().unwrap();
    assert_eq!(retired_variant.parent_ids(), vec![master.id.to_string().as_str()]);
}

#[test]
fn retire_record_ignores_the_registry() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let record = protein("P12345", 1, "MKV");
    repo.create_record(&record).unwrap();
    let registry = SnapshotRegistry::default();
    let service = UpdateService::new(&repo, &registry, &archive, &settings);

    let report = service.retire_record(record.id).unwrap();
    assert_eq!(report.dead_accession.as_deref(), Some("P12345"));
    assert!(repo.get_record(record.id).unwrap().unwrap().is_sync_excluded());

    let ghost = protein("P00000", 2, "MKV");
    let err = service.retire_record(ghost.id).unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Repo(RepoError::NotFound { id, .. }) if id == ghost.id
    ));
}

#[test]
fn unknown_accession_without_records_is_skipped() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let registry = SnapshotRegistry::default();

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P00000")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Skipped);
    assert!(outcome.retirements.is_empty());
}

#[test]
fn secondary_record_is_promoted_and_merged_into_master() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let master = protein("P12345", 1, "MKVLAAGIV");
    let stale = protein("Q00001", 2, "MKVLAAGIV");
    repo.create_record(&master).unwrap();
    repo.create_record(&stale).unwrap();
    attach(&repo, &master, Range::certain(0, 2));
    attach(&repo, &stale, Range::certain(3, 5));

    let mut current = entry("P12345", "MKVLAAGIV", 1);
    current.secondary_accessions = vec!["Q00001".to_string()];
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Updated);
    assert!(matches!(
        outcome.promotions.as_slice(),
        [PromotionOutcome::Promoted { record_id, .. }] if *record_id == stale.id
    ));
    assert_eq!(outcome.merges.len(), 1);
    assert_eq!(outcome.deleted, vec![stale.id]);

    assert!(repo.get_record(stale.id).unwrap().is_none());
    assert_eq!(repo.list_participations(master.id).unwrap().len(), 2);
    assert!(repo.find_by_identity("uniprotkb", "Q00001").unwrap().is_empty());
    let merged = repo.get_record(master.id).unwrap().unwrap();
    assert!(merged
        .xrefs
        .iter()
        .any(|xref| xref.qualifier == Qualifier::SecondaryId && xref.primary_id == "Q00001"));
}

#[test]
fn querying_by_secondary_accession_reaches_the_primary_entry() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let stale = protein("Q00001", 1, "MKV");
    repo.create_record(&stale).unwrap();
    let mut current = entry("P12345", "MKV", 1);
    current.secondary_accessions = vec!["Q00001".to_string()];
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("q00001")
        .unwrap();

    assert_eq!(outcome.resolved_accession.as_deref(), Some("P12345"));
    assert_eq!(outcome.status, AccessionStatus::Updated);
    let promoted = repo.get_record(stale.id).unwrap().unwrap();
    assert_eq!(promoted.identity_xref("uniprotkb").unwrap().primary_id, "P12345");
}

#[test]
fn ambiguous_accession_is_skipped_with_conflict() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let record = protein("Q00002", 1, "MST");
    repo.create_record(&record).unwrap();
    let mut first = entry("P67890", "MSTN", 1);
    first.secondary_accessions = vec!["Q00002".to_string()];
    let mut second = entry("P67891", "MSTP", 1);
    second.secondary_accessions = vec!["Q00002".to_string()];
    let registry = SnapshotRegistry::from_entries([first, second]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("Q00002")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Skipped);
    assert!(matches!(
        &outcome.conflicts[0].kind,
        ConflictKind::AmbiguousAccession { candidates } if candidates.len() == 2
    ));
    assert_eq!(repo.get_record(record.id).unwrap().unwrap(), record);
}

#[test]
fn organism_conflict_keeps_secondary_record_apart() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let mut master = protein("P12345", 1, "MKV");
    master.organism_taxid = Some(9606);
    let mut mouse = protein("Q00001", 2, "MKV");
    mouse.organism_taxid = Some(10090);
    repo.create_record(&master).unwrap();
    repo.create_record(&mouse).unwrap();

    let mut current = entry("P12345", "MKV", 1);
    current.secondary_accessions = vec!["Q00001".to_string()];
    current.organism_taxid = Some(9606);
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.conflicts.len(), 1);
    assert!(outcome.merges.is_empty());
    assert_eq!(repo.get_record(mouse.id).unwrap().unwrap(), mouse);
}

#[test]
fn transcripts_follow_registry_or_are_retired() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let master = protein("P12345", 1, "MKVLAAGIV");
    let known = isoform("P12345-2", &master, "MKVAAGI");
    let gone = isoform("P12345-9", &master, "MKV");
    for record in [&master, &known, &gone] {
        repo.create_record(record).unwrap();
    }

    let mut current = entry("P12345", "MKVLAAGIV", 1);
    current.transcripts = vec![RegistryTranscript {
        accession: "P12345-2".to_string(),
        kind: RecordKind::Isoform,
        sequence: Some("MKVAAGIV".to_string()),
        sequence_version: Some(2),
    }];
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Updated);
    assert_eq!(outcome.retirements.len(), 1);
    assert_eq!(outcome.retirements[0].record_id, gone.id);

    let refreshed = repo.get_record(known.id).unwrap().unwrap();
    assert_eq!(refreshed.sequence.as_deref(), Some("MKVAAGIV"));
    assert_eq!(refreshed.sequence_version, Some(2));
    assert!(repo.get_record(gone.id).unwrap().unwrap().is_sync_excluded());
}

#[test]
fn batch_reports_failures_and_keeps_going() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();

    let record = protein("P12345", 1, "MKV");
    repo.create_record(&record).unwrap();
    let registry = FlakyRegistry {
        inner: SnapshotRegistry::from_entries([entry("P12345", "MKVL", 2)]),
        broken: "P11111",
    };

    let report = UpdateService::new(&repo, &registry, &archive, &settings)
        .run_batch(&["P11111".to_string(), "P12345".to_string()]);

    assert_eq!(report.outcomes[0].status, AccessionStatus::Failed);
    assert!(report.outcomes[0].errors[0].contains("connection reset"));
    assert_eq!(report.outcomes[1].status, AccessionStatus::Updated);

    let summary = report.summary();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.updated, 1);
}

#[test]
fn tracked_accessions_skip_excluded_and_transcript_only_accessions() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let registry = SnapshotRegistry::default();

    let tracked = protein("P12345", 1, "MKV");
    let mut excluded = protein("P67890", 2, "MST");
    excluded
        .annotations
        .push(Annotation::new(Topic::NoLongerSynced, None));
    let variant = isoform("P12345-2", &tracked, "MK");
    for record in [&tracked, &excluded, &variant] {
        repo.create_record(record).unwrap();
    }

    let accessions = UpdateService::new(&repo, &registry, &archive, &settings)
        .tracked_accessions()
        .unwrap();

    assert_eq!(accessions, vec!["P12345".to_string()]);
}

#[test]
fn failed_group_merge_does_not_abort_the_accession() {
    let conn = open_db_in_memory().unwrap();
    let master = protein("P12345", 1, "MKVLAAGIV");
    let kept = isoform("P12345-2", &master, "MKVAAGI");
    let lost = isoform("P12345-2", &master, "MKVAAGI");
    let repo = VanishingRecord {
        inner: SqliteRecordRepository::try_new(&conn).unwrap(),
        vanished: lost.id,
    };
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    for record in [&master, &kept, &lost] {
        repo.create_record(record).unwrap();
    }

    let mut current = entry("P12345", "MKVLAAGIVW", 2);
    current.transcripts = vec![RegistryTranscript {
        accession: "P12345-2".to_string(),
        kind: RecordKind::Isoform,
        sequence: Some("MKVAAGIV".to_string()),
        sequence_version: Some(2),
    }];
    let registry = SnapshotRegistry::from_entries([current]);

    let outcome = UpdateService::new(&repo, &registry, &archive, &settings)
        .process_accession("P12345")
        .unwrap();

    assert_eq!(outcome.status, AccessionStatus::Updated);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains(&lost.id.to_string()));
    assert!(outcome.merges.is_empty());

    let refreshed = repo.get_record(master.id).unwrap().unwrap();
    assert_eq!(refreshed.sequence.as_deref(), Some("MKVLAAGIVW"));
    assert_eq!(refreshed.sequence_version, Some(2));
    assert_eq!(repo.get_record(kept.id).unwrap().unwrap(), kept);
}
