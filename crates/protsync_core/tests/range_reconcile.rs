use protsync_core::db::open_db_in_memory;
use protsync_core::model::range::{Position, PositionStatus, Range, RangeId};
use protsync_core::model::record::{Annotation, CrossReference, Feature, Participation, Record, RecordKind};
use protsync_core::model::vocabulary::{Qualifier, Topic};
use protsync_core::reconcile::{EngineSettings, InvalidCause, RangeReconciler};
use protsync_core::registry::SnapshotArchive;
use protsync_core::repo::{RecordRepository, SqliteRecordRepository};

fn tracked_protein(sequence: Option<&str>, version: Option<u32>) -> Record {
    let mut record = Record::with_created_at(RecordKind::Protein, "kinase", 1);
    record.sequence = sequence.map(str::to_string);
    record.sequence_version = version;
    record
        .xrefs
        .push(CrossReference::new("uniprotkb", Qualifier::Identity, "P12345"));
    record
}

fn store(repo: &SqliteRecordRepository<'_>, record: &Record, feature: Feature) -> Participation {
    repo.create_record(record).unwrap();
    let participation = Participation::new(record.id, "EBI-1").with_feature(feature);
    repo.create_participation(&participation).unwrap();
    participation
}

fn stored_feature(repo: &SqliteRecordRepository<'_>, record: &Record) -> Feature {
    repo.list_participations(record.id).unwrap()[0].features[0].clone()
}

fn ledger_topics(feature: &Feature, range_id: RangeId) -> Vec<Topic> {
    let mut topics: Vec<Topic> = feature
        .annotations
        .iter()
        .filter(|annotation| annotation.range_id == Some(range_id))
        .map(|annotation| annotation.topic.clone())
        .collect();
    topics.sort_by(|left, right| left.label().cmp(right.label()));
    topics
}

fn conflicted_feature(range: &Range, version: &str) -> Feature {
    let mut feature = Feature::new("binding region").with_range(range.clone());
    feature.annotations.extend([
        Annotation::for_range(
            Topic::InvalidRange,
            range.id,
            Some("residues `BC` of range 1-2 are not present".to_string()),
        ),
        Annotation::for_range(Topic::RangeConflicts, range.id, Some("1-2".to_string())),
        Annotation::for_range(Topic::SequenceVersion, range.id, Some(version.to_string())),
    ]);
    feature
}

#[test]
fn insertion_shifts_range_and_records_subsequence() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::certain(2, 3);
    store(&repo, &record, Feature::new("region").with_range(range.clone()));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("ABXCDE"))
        .unwrap();

    assert_eq!(report.shifted.len(), 1);
    assert_eq!(report.shifted[0].before, "2-3");
    assert_eq!(report.shifted[0].after, "3-4");
    let stored = &stored_feature(&repo, &record).ranges[0];
    assert_eq!(stored.start, Position::certain(3));
    assert_eq!(stored.end, Position::certain(4));
    assert_eq!(stored.sequence.as_deref(), Some("CD"));
}

#[test]
fn unplaceable_range_becomes_undetermined_with_ledger() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::certain(1, 2);
    store(&repo, &record, Feature::new("region").with_range(range.clone()));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("ABXDE"))
        .unwrap();

    assert_eq!(report.invalid.len(), 1);
    assert_eq!(report.invalid[0].cause, InvalidCause::Ambiguous);
    assert_eq!(report.invalid[0].previous_positions, "1-2");
    assert_eq!(report.annotations_added.len(), 3);

    let feature = stored_feature(&repo, &record);
    let stored = &feature.ranges[0];
    assert_eq!(stored.id, range.id);
    assert_eq!(stored.start, Position::undetermined());
    assert_eq!(stored.end, Position::undetermined());
    assert_eq!(
        stored.start.status,
        Some(PositionStatus::Undetermined)
    );
    assert_eq!(
        ledger_topics(&feature, range.id),
        vec![Topic::InvalidRange, Topic::RangeConflicts, Topic::SequenceVersion]
    );
    let conflicts = feature
        .annotations
        .iter()
        .find(|annotation| annotation.topic == Topic::RangeConflicts)
        .unwrap();
    assert_eq!(conflicts.text.as_deref(), Some("1-2"));
}

#[test]
fn range_outside_previous_sequence_is_out_of_bounds() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABC"), None);
    store(&repo, &record, Feature::new("region").with_range(Range::certain(1, 7)));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABC"), Some("ABCD"))
        .unwrap();

    assert_eq!(report.invalid[0].cause, InvalidCause::OutOfBounds);
    // No sequence version is known, so no version entry is written.
    assert_eq!(report.annotations_added.len(), 2);
}

#[test]
fn repeated_runs_never_duplicate_ledger_annotations() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::certain(1, 2);
    store(&repo, &record, Feature::new("region").with_range(range.clone()));
    let reconciler = RangeReconciler::new(&repo, &archive, &settings);

    reconciler
        .reconcile(&record, Some("ABCDE"), Some("ABXDE"))
        .unwrap();
    let second = reconciler
        .reconcile(&record, Some("ABCDE"), Some("ABXDE"))
        .unwrap();

    assert!(second.annotations_added.is_empty());
    assert!(second.annotations_removed.is_empty());
    assert_eq!(second.unrecovered.len(), 1);
    assert_eq!(stored_feature(&repo, &record).annotations.len(), 3);
}

#[test]
fn conflicting_range_recovers_from_archived_version() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let mut archive = SnapshotArchive::new();
    archive.insert("P12345", 1, "ABCDE");
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABXDE"), Some(2));
    let range = Range::undetermined();
    store(&repo, &record, conflicted_feature(&range, "1"));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABXDE"), Some("ZABCDE"))
        .unwrap();

    assert_eq!(report.recovered.len(), 1);
    assert_eq!(report.recovered[0].before, "1-2");
    assert_eq!(report.recovered[0].after, "2-3");
    assert_eq!(report.annotations_removed.len(), 3);

    let feature = stored_feature(&repo, &record);
    assert!(feature.annotations.is_empty());
    assert_eq!(feature.ranges[0].start, Position::certain(2));
    assert_eq!(feature.ranges[0].sequence.as_deref(), Some("BC"));
}

#[test]
fn unarchived_version_leaves_conflict_in_place() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABXDE"), Some(2));
    let range = Range::undetermined();
    store(&repo, &record, conflicted_feature(&range, "1"));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABXDE"), Some("ZABCDE"))
        .unwrap();

    assert!(report.recovered.is_empty());
    assert!(report.unrecovered[0].reason.contains("not archived"));
    let feature = stored_feature(&repo, &record);
    assert!(feature.ranges[0].is_undetermined());
    assert_eq!(
        ledger_topics(&feature, range.id),
        vec![Topic::InvalidRange, Topic::RangeConflicts, Topic::SequenceVersion]
    );
}

#[test]
fn stale_ledger_entries_are_removed() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::certain(1, 2);
    let mut feature = Feature::new("region").with_range(range.clone());
    feature.annotations.extend([
        Annotation::for_range(Topic::InvalidRange, range.id, Some("old".to_string())),
        Annotation::new(Topic::RangeConflicts, Some("3-4".to_string())),
        Annotation::new(Topic::Caution, Some("curator note".to_string())),
    ]);
    store(&repo, &record, feature);

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("ABCDE"))
        .unwrap();

    assert_eq!(report.annotations_removed.len(), 2);
    let feature = stored_feature(&repo, &record);
    assert_eq!(feature.annotations.len(), 1);
    assert_eq!(feature.annotations[0].topic, Topic::Caution);
}

#[test]
fn missing_previous_sequence_records_subsequence_or_flags_positions() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(None, None);
    let fits = Range::certain(1, 2);
    let overflows = Range::certain(3, 9);
    store(
        &repo,
        &record,
        Feature::new("region")
            .with_range(fits.clone())
            .with_range(overflows.clone()),
    );

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, None, Some("ABCDE"))
        .unwrap();

    assert_eq!(report.sequences_recorded, vec![fits.id]);
    assert_eq!(report.invalid[0].cause, InvalidCause::InvalidPositions);
    let feature = stored_feature(&repo, &record);
    assert_eq!(feature.ranges[0].sequence.as_deref(), Some("BC"));
    assert!(feature.ranges[1].is_undetermined());
    assert_eq!(ledger_topics(&feature, overflows.id), vec![Topic::InvalidPositions]);
}

#[test]
fn terminal_range_is_reanchored_to_new_ends() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::new(
        Position::with_status(PositionStatus::NTerminal, 0, 0),
        Position::with_status(PositionStatus::CTerminal, 4, 4),
    );
    store(&repo, &record, Feature::new("whole chain").with_range(range));

    RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("MABCDEFG"))
        .unwrap();

    let stored = &stored_feature(&repo, &record).ranges[0];
    assert_eq!(stored.end, Position::with_status(PositionStatus::CTerminal, 7, 7));
    assert_eq!(stored.sequence.as_deref(), Some("MABCDEFG"));
}

#[test]
fn untyped_range_is_rewritten_to_canonical_undetermined() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::new(
        Position {
            status: None,
            min: 2,
            max: 2,
        },
        Position::certain(3),
    );
    store(&repo, &record, Feature::new("region").with_range(range.clone()));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("ABXCDE"))
        .unwrap();

    assert_eq!(report.normalized, vec![range.id]);
    assert!(report.invalid.is_empty());
    let stored = &stored_feature(&repo, &record).ranges[0];
    assert_eq!(stored.start, Position::undetermined());
    assert_eq!(stored.end, Position::undetermined());

    let again = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABXCDE"), Some("ABXCDE"))
        .unwrap();
    assert!(again.is_empty());
}

#[test]
fn lone_undetermined_endpoint_is_invalidated() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    let archive = SnapshotArchive::new();
    let settings = EngineSettings::default();
    let record = tracked_protein(Some("ABCDE"), Some(1));
    let range = Range::new(Position::undetermined(), Position::certain(3));
    store(&repo, &record, Feature::new("region").with_range(range.clone()));

    let report = RangeReconciler::new(&repo, &archive, &settings)
        .reconcile(&record, Some("ABCDE"), Some("ABXCDE"))
        .unwrap();

    assert_eq!(report.invalid.len(), 1);
    assert_eq!(report.invalid[0].cause, InvalidCause::OutOfBounds);
    let stored = &stored_feature(&repo, &record).ranges[0];
    assert!(stored.is_canonical_undetermined());
}
