//! Taxonomy backfill: classify rows whose taxonomy cells are missing and fill
//! only those cells.

use std::path::Path;

use jobhub_core::{NormalizedRecord, Table};
use jobhub_storage::{StoreError, TableStore};
use jobhub_taxonomy::Classifier;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillCounts {
    /// Rows that needed classification.
    pub updated: usize,
    /// Rows where at least one cell's text changed.
    pub changed: usize,
}

/// `None` when the record already has every taxonomy cell, otherwise whether
/// any cell changed. Present cells are never replaced.
pub fn fill_taxonomy_gaps(record: &mut NormalizedRecord, classifier: &Classifier) -> Option<bool> {
    if !record.needs_taxonomy() {
        return None;
    }
    let result = classifier.classify_record(record);
    let mut changed = false;
    for (column, value) in result.filled() {
        if record.is_missing(column) {
            record.set(column, Some(value));
            changed = true;
        }
    }
    Some(changed)
}

pub fn backfill(table: &mut Table, classifier: &Classifier) -> BackfillCounts {
    let mut counts = BackfillCounts::default();
    for row in table.rows_mut() {
        if let Some(changed) = fill_taxonomy_gaps(row, classifier) {
            counts.updated += 1;
            if changed {
                counts.changed += 1;
            }
        }
    }
    counts
}

/// Backfill one persisted table through the store. Missing or empty tables
/// are left alone; nothing is written when no row changed.
pub async fn backfill_file(
    store: &TableStore,
    path: &Path,
    classifier: &Classifier,
) -> Result<BackfillCounts, StoreError> {
    let mut loaded = store.load_for_merge(path).await?;
    if loaded.table.is_empty() {
        return Ok(BackfillCounts::default());
    }
    let counts = backfill(&mut loaded.table, classifier);
    if counts.changed > 0 {
        store.commit(&loaded.table, path).await?;
    }
    info!(path = %path.display(), updated = counts.updated, changed = counts.changed, "taxonomy backfill");
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::embedded().unwrap()
    }

    #[test]
    fn only_missing_cells_are_written() {
        let mut record = NormalizedRecord {
            title: Some("Software Engineer".into()),
            skills: Some("python, django".into()),
            category_primary: Some("IT".into()),
            domain_l1: Some("Platform".into()),
            ..Default::default()
        };
        assert_eq!(fill_taxonomy_gaps(&mut record, &classifier()), Some(true));
        assert_eq!(record.domain_l1.as_deref(), Some("Platform"));
        assert_eq!(record.domain_l2.as_deref(), Some("Python"));
        assert_eq!(record.domain_l3.as_deref(), Some("Django"));
        assert!(record.tax_confidence.is_some());
    }

    #[test]
    fn classified_rows_are_untouched_and_counts_add_up() {
        let complete = NormalizedRecord {
            title: Some("Civil Engineer".into()),
            category_primary: Some("IT".into()),
            domain_l1: Some("Backend".into()),
            domain_l2: Some("Python".into()),
            domain_l3: Some("Other".into()),
            tax_confidence: Some("0.90".into()),
            ..Default::default()
        };
        let blank = NormalizedRecord::default();
        let mut table = Table::from_records([complete.clone(), blank]);

        let counts = backfill(&mut table, &classifier());
        assert_eq!(counts, BackfillCounts { updated: 1, changed: 1 });
        assert_eq!(table.rows()[0], complete);
        let filled = &table.rows()[1];
        assert_eq!(filled.category_primary.as_deref(), Some("Non-IT"));
        assert_eq!(filled.domain_l1.as_deref(), Some("Non-IT-Other"));
        assert_eq!(filled.domain_l2.as_deref(), Some("Other"));
        assert_eq!(filled.domain_l3.as_deref(), Some("Other"));
        assert_eq!(filled.tax_confidence.as_deref(), Some("0.35"));

        assert_eq!(backfill(&mut table, &classifier()), BackfillCounts::default());
    }
}
