use std::fs;
use std::time::Duration;

use jobhub_adapters::{source_for_portal, ColumnOverrides, ExportSource, JsonDropSource, KeyFallback, RecordSource, SourceSpec};
use tempfile::tempdir;

#[tokio::test]
async fn json_drop_reads_arrays_and_lines_and_skips_broken_files() {
    let dir = tempdir().expect("tempdir");
    let inbox = dir.path().join("inbox/merojob");
    fs::create_dir_all(&inbox).unwrap();
    fs::write(
        inbox.join("a.json"),
        r#"[{"title": "Accountant", "job_url": "https://m/1"}, {"title": "Driver", "job_url": "https://m/2"}]"#,
    )
    .unwrap();
    fs::write(
        inbox.join("b.jsonl"),
        "{\"title\": \"Nurse\", \"job_id\": \"77\"}\n\n{\"title\": \"Chef\"}\n",
    )
    .unwrap();
    fs::write(inbox.join("c.json"), "[{\"title\": \"half writ").unwrap();
    fs::write(inbox.join("~$d.json"), "[]").unwrap();

    let source = JsonDropSource::new("merojob", &inbox);
    let batch = source.collect().await.unwrap();
    assert_eq!(batch.records.len(), 4);
    assert_eq!(batch.origin_files.len(), 2);
    assert_eq!(batch.records[2].get("job_id"), Some("77"));
    assert_eq!(source.key_fallback(), KeyFallback::Composite);

    source.acknowledge(&batch).await.unwrap();
    assert!(inbox.join("processed/a.json").exists());
    assert!(inbox.join("processed/b.jsonl").exists());
    assert!(inbox.join("c.json").exists());

    let again = source.collect().await.unwrap();
    assert!(again.records.is_empty());
}

#[tokio::test]
async fn missing_inbox_is_an_empty_batch() {
    let dir = tempdir().expect("tempdir");
    let source = source_for_portal("jobsnepal", &SourceSpec::default(), dir.path());
    assert_eq!(source.portal(), "jobsnepal");
    let batch = source.collect().await.unwrap();
    assert!(batch.records.is_empty());
}

#[tokio::test]
async fn export_source_reads_newest_file_with_fuzzy_columns() {
    let dir = tempdir().expect("tempdir");
    let exports = dir.path().join("linkedin_exports");
    fs::create_dir_all(&exports).unwrap();
    fs::write(exports.join("old.csv"), "Title,Company\nStale,Old Co\n").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    fs::write(
        exports.join("saved_jobs.csv"),
        "\u{feff}Job Title,Company Name,Job Location,Saved On,Posting Link\n\
         Data Analyst,Acme,Kathmandu,2024-06-01,\n\
         Backend Engineer,Beta,Pokhara,2024-06-02,https://www.linkedin.com/jobs/view/1\n",
    )
    .unwrap();

    let source = ExportSource::new("linkedin", &exports, "linkedin", ColumnOverrides::default());
    let batch = source.collect().await.unwrap();
    assert_eq!(batch.label, "saved_jobs.csv");
    assert_eq!(batch.records.len(), 2);

    let first = &batch.records[0];
    assert_eq!(first.get("title"), Some("Data Analyst"));
    assert_eq!(first.get("company"), Some("Acme"));
    assert_eq!(first.get("location"), Some("Kathmandu"));
    assert_eq!(first.get("posted_date"), Some("2024-06-01"));
    assert_eq!(first.get("job_url"), Some(""));
    assert!(first.get("scraped_at").is_some());
    assert_eq!(
        batch.records[1].get("job_url"),
        Some("https://www.linkedin.com/jobs/view/1")
    );
    assert_eq!(
        source.key_fallback(),
        KeyFallback::Fingerprint {
            scheme: "linkedin".into()
        }
    );
}

#[tokio::test]
async fn export_column_overrides_win() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("e.csv"), "role,headline\nIgnored,Wanted\n").unwrap();
    let overrides = ColumnOverrides {
        title: Some("Headline".into()),
        ..Default::default()
    };
    let source = ExportSource::new("linkedin", dir.path(), "linkedin", overrides);
    let batch = source.collect().await.unwrap();
    assert_eq!(batch.records[0].get("title"), Some("Wanted"));
}
