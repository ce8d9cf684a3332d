use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use seqstage::accession::AccessionKind;
use seqstage::error::SeqstageError;
use seqstage::record::{SampleRecord, StudyRecord};
use seqstage::store::AccessionStore;

fn store_at(temp: &tempfile::TempDir) -> AccessionStore {
    let root = Utf8PathBuf::from_path_buf(temp.path().join("db")).unwrap();
    AccessionStore::new_with_root(root)
}

fn study(id: &str, title: &str) -> StudyRecord {
    StudyRecord {
        accession_id: id.parse().unwrap(),
        title: title.to_string(),
        summary: String::new(),
        child_sample_ids: Vec::new(),
    }
}

#[test]
fn tables_are_separate_per_kind() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_at(&temp);

    store.put(&study("GSE1", "study one")).unwrap();
    let sample = SampleRecord {
        accession_id: "GSM1".parse().unwrap(),
        title: "sample one".to_string(),
        species: String::new(),
        raw_link: String::new(),
        parent_study_id: "GSE1".parse().unwrap(),
        child_run_ids: Vec::new(),
    };
    store.put(&sample).unwrap();

    assert!(store.table_path(AccessionKind::Study).as_std_path().is_file());
    assert!(store.table_path(AccessionKind::Sample).as_std_path().is_file());
    assert!(store.exists::<StudyRecord>("GSE1").unwrap());
    assert!(!store.exists::<SampleRecord>("GSE1").unwrap());
}

#[test]
fn bad_header_on_disk_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_at(&temp);
    store.put(&study("GSE1", "one")).unwrap();

    let path = store.table_path(AccessionKind::Study);
    std::fs::write(path.as_std_path(), "accession_id\ttitle\nGSE1\tone\n").unwrap();

    let fresh = store_at(&temp);
    let err = fresh.get::<StudyRecord>("GSE1").unwrap_err();
    assert_matches!(
        err,
        SeqstageError::SchemaMismatch {
            kind: AccessionKind::Study,
            ..
        }
    );
}

#[test]
fn reload_sees_external_changes() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_at(&temp);
    store.put(&study("GSE1", "one")).unwrap();

    // Another store instance writes behind this one's back.
    let other = store_at(&temp);
    other.put(&study("GSE2", "two")).unwrap();

    assert!(!store.exists::<StudyRecord>("GSE2").unwrap());
    store.reload(AccessionKind::Study).unwrap();
    assert!(store.exists::<StudyRecord>("GSE2").unwrap());
}

#[test]
fn put_many_commits_the_whole_batch() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_at(&temp);
    let records: Vec<StudyRecord> = (1..=4)
        .map(|n| study(&format!("GSE{n}"), &format!("study {n}")))
        .collect();
    store.put_many(&records).unwrap();

    let fresh = store_at(&temp);
    let all = fresh.all::<StudyRecord>().unwrap();
    assert_eq!(all.len(), 4);
    let ids: Vec<&str> = all.iter().map(|record| record.accession_id.as_str()).collect();
    assert_eq!(ids, vec!["GSE1", "GSE2", "GSE3", "GSE4"]);
}

#[test]
fn conflicting_batch_leaves_table_untouched() {
    let temp = tempfile::tempdir().unwrap();
    let store = store_at(&temp);
    store.put(&study("GSE1", "original")).unwrap();

    let batch = vec![study("GSE2", "new"), study("GSE1", "conflicting")];
    let err = store.put_many(&batch).unwrap_err();
    assert_matches!(err, SeqstageError::DuplicateKey { .. });

    let fresh = store_at(&temp);
    assert_eq!(fresh.all::<StudyRecord>().unwrap().len(), 1);
    assert!(!fresh.exists::<StudyRecord>("GSE2").unwrap());
}
