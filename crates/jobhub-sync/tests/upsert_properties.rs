use std::time::Duration;

use jobhub_core::{assign_key, normalize, RawRecord, KEY_COLUMN};
use jobhub_storage::{decode_table, BackoffPolicy, CommitOutcome, TableStore};
use jobhub_sync::{upsert_file, UpsertOptions};
use tempfile::tempdir;

fn store() -> TableStore {
    TableStore::new(
        None,
        BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    )
}

fn record(portal: &str, fields: &[(&str, &str)]) -> jobhub_core::NormalizedRecord {
    let raw = fields
        .iter()
        .fold(RawRecord::new(), |raw, (k, v)| raw.with(*k, *v));
    let mut record = normalize(&raw, portal);
    assign_key(&mut record);
    record
}

#[tokio::test]
async fn batch_then_fuller_batch_converges_without_duplicates() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("merojob_jobs.csv");
    let store = store();
    let options = UpsertOptions::default();

    let batch_a = vec![record(
        "merojob",
        &[("job_url", "https://m/1"), ("title", "Accountant"), ("company", "Non"), ("scraped_at", "2024-01-01T00:00:00")],
    )];
    let first = upsert_file(&store, &path, batch_a, KEY_COLUMN, &options).await.unwrap();
    assert_eq!(first.outcome.inserted, 1);
    assert_eq!(first.commit, CommitOutcome::Synced);

    let batch_b = vec![
        record(
            "merojob",
            &[("job_url", "https://m/1"), ("title", "Senior Accountant"), ("company", "Acme"), ("scraped_at", "2024-02-01T00:00:00")],
        ),
        record(
            "merojob",
            &[("job_url", "https://m/2"), ("title", "Driver"), ("scraped_at", "2024-01-15T00:00:00")],
        ),
    ];
    let second = upsert_file(&store, &path, batch_b, KEY_COLUMN, &options).await.unwrap();
    assert_eq!(second.outcome.inserted, 1);
    assert_eq!(second.outcome.updated, 1);
    assert_eq!(second.rows_after, 2);

    let table = decode_table(&path, &std::fs::read(&path).unwrap()).unwrap();
    let first_row = &table.rows()[0];
    assert_eq!(first_row.job_url.as_deref(), Some("https://m/1"));
    assert_eq!(first_row.title.as_deref(), Some("Accountant"));
    assert_eq!(first_row.company.as_deref(), Some("Acme"));
    assert_eq!(first_row.scraped_at.as_deref(), Some("2024-02-01T00:00:00"));
    assert_eq!(table.rows()[1].job_url.as_deref(), Some("https://m/2"));
}

#[tokio::test]
async fn replaying_a_batch_changes_nothing() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("jobsnepal_jobs.csv");
    let store = store();
    let batch = vec![
        record("jobsnepal", &[("job_id", "7"), ("title", "Nurse"), ("scraped_at", "2024-03-01T10:00:00")]),
        record("jobsnepal", &[("title", "Chef"), ("company", "Hotel Yak"), ("location", "Pokhara")]),
    ];

    upsert_file(&store, &path, batch.clone(), KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap();
    let before = std::fs::read(&path).unwrap();
    let replay = upsert_file(&store, &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(replay.outcome.inserted, 0);
    assert_eq!(replay.outcome.updated, 0);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn corrupted_table_is_quarantined_and_rebuilt() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("merojob_jobs.csv");
    std::fs::write(&path, b"PK\x03\x04\xff\xff broken workbook").unwrap();

    let batch = vec![record("merojob", &[("job_url", "https://m/9"), ("title", "Teacher")])];
    let result = upsert_file(&store(), &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap();

    let quarantined = result.recovered_from.expect("quarantined copy");
    assert_eq!(std::fs::read(&quarantined).unwrap(), b"PK\x03\x04\xff\xff broken workbook");
    let table = decode_table(&path, &std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn corrupted_table_with_cache_keeps_original_bytes_and_rebuilds_remote() {
    let dir = tempdir().expect("tempdir");
    let cache = dir.path().join("cache");
    let path = dir.path().join("merojob_jobs.csv");
    std::fs::write(&path, b"PK\x03\x04\xff\xff broken workbook").unwrap();
    let store = TableStore::new(
        Some(cache.clone()),
        BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );

    let batch = vec![record("merojob", &[("job_url", "https://m/9"), ("title", "Teacher")])];
    let result = upsert_file(&store, &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(result.commit, CommitOutcome::Synced);

    let quarantined = result.recovered_from.expect("quarantined copy");
    assert_eq!(std::fs::read(&quarantined).unwrap(), b"PK\x03\x04\xff\xff broken workbook");
    let beside_remote: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("merojob_jobs.csv.corrupted_")
        })
        .collect();
    assert_eq!(beside_remote.len(), 1);
    assert_eq!(std::fs::read(&beside_remote[0]).unwrap(), b"PK\x03\x04\xff\xff broken workbook");

    let remote = decode_table(&path, &std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(remote.len(), 1);
    let mirror = cache.join("merojob_jobs.csv");
    assert_eq!(std::fs::read(&mirror).unwrap(), std::fs::read(&path).unwrap());
}

#[tokio::test]
async fn unreadable_remote_with_empty_cache_fails_without_overwriting() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("remote");
    std::fs::write(&blocker, b"").unwrap();
    let path = blocker.join("merojob_jobs.csv");
    let store = TableStore::new(
        Some(dir.path().join("cache")),
        BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    );

    let batch = vec![record("merojob", &[("job_url", "https://m/1")])];
    let err = upsert_file(&store, &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(!dir.path().join("cache/merojob_jobs.csv").exists());
}

#[tokio::test]
async fn identical_composite_records_collapse_within_a_portal() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("merojob_jobs.csv");
    let fields = [("title", "Cashier"), ("company", "Bhatbhateni"), ("location", "Kathmandu")];
    let batch = vec![record("merojob", &fields), record("merojob", &fields)];

    let result = upsert_file(&store(), &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(result.rows_after, 1);
    let table = decode_table(&path, &std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(
        table.rows()[0].global_key.as_deref(),
        Some("merojob:cashier:bhatbhateni:kathmandu")
    );
}

#[tokio::test]
async fn unreachable_table_location_is_a_transient_error() {
    let dir = tempdir().expect("tempdir");
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"").unwrap();
    let path = blocker.join("merojob_jobs.csv");

    let batch = vec![record("merojob", &[("job_url", "https://m/1")])];
    let err = upsert_file(&store(), &path, batch, KEY_COLUMN, &UpsertOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
