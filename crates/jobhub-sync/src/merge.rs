//! UPSERT merge of normalized records into a persisted table.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use jobhub_core::{assign_key, compare_timestamps, NormalizedRecord, Table, KEY_COLUMN, SCHEMA_COLUMNS, SCRAPED_AT_COLUMN};
use jobhub_storage::{CommitOutcome, StoreError, TableStore};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Columns an existing row may take values for. `None` means every
    /// column except the dedupe key.
    pub update_columns: Option<Vec<String>>,
    /// Replace present values instead of only filling gaps.
    pub overwrite_existing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_without_key: usize,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_without_key += other.skipped_without_key;
    }
}

/// Trimmed key for `record`, written back into the key column. Rows missing a
/// `global_key` get one resolved from their fields.
fn key_for(record: &mut NormalizedRecord, dedupe_key: &str) -> Option<String> {
    let stored = record
        .get(dedupe_key)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    let key = match stored {
        Some(key) => key,
        None if dedupe_key == KEY_COLUMN => assign_key(record).into_string(),
        None => return None,
    };
    if key.is_empty() {
        return None;
    }
    record.set(dedupe_key, Some(key.clone()));
    Some(key)
}

fn record_columns(record: &NormalizedRecord) -> Vec<String> {
    SCHEMA_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(record.extra.keys().cloned())
        .collect()
}

/// A later parseable `scraped_at` replaces an earlier one; a missing one is
/// filled. Unparseable values never replace anything.
fn refresh_scraped_at(existing: &mut NormalizedRecord, incoming: &NormalizedRecord) -> bool {
    let Some(candidate) = incoming.scraped_at.as_deref() else {
        return false;
    };
    let newer = match existing.scraped_at.as_deref() {
        None => true,
        Some(current) => compare_timestamps(candidate, current) == Some(Ordering::Greater),
    };
    if newer {
        existing.scraped_at = Some(candidate.to_string());
    }
    newer
}

/// Returns true when any cell of `existing` changed. A missing incoming value
/// never overwrites anything.
fn merge_into(
    existing: &mut NormalizedRecord,
    incoming: &NormalizedRecord,
    dedupe_key: &str,
    options: &UpsertOptions,
) -> bool {
    let columns = match &options.update_columns {
        Some(columns) => columns.clone(),
        None => record_columns(incoming),
    };
    let mut changed = false;
    for column in columns
        .iter()
        .filter(|c| c.as_str() != dedupe_key && c.as_str() != SCRAPED_AT_COLUMN)
    {
        let Some(value) = incoming.get(column) else {
            continue;
        };
        let replace = match existing.get(column) {
            None => true,
            Some(current) => options.overwrite_existing && current != value,
        };
        if replace {
            existing.set(column, Some(value.to_string()));
            changed = true;
        }
    }
    refresh_scraped_at(existing, incoming) || changed
}

/// Merge `records` into `table` keyed by `dedupe_key`.
///
/// Records are applied in order, so duplicates inside one batch merge into a
/// single row. Duplicate keys already in the table collapse first, keeping
/// the last occurrence with gaps filled from the earlier ones. The result is
/// sorted newest `scraped_at` first.
pub fn upsert(
    table: &mut Table,
    records: Vec<NormalizedRecord>,
    dedupe_key: &str,
    options: &UpsertOptions,
) -> UpsertOutcome {
    let columns = table.columns().to_vec();
    let existing = std::mem::take(table).into_rows();

    let mut outcome = UpsertOutcome::default();
    let mut rows: Vec<NormalizedRecord> = Vec::with_capacity(existing.len() + records.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for mut row in existing {
        match key_for(&mut row, dedupe_key) {
            None => rows.push(row),
            Some(key) => match index.get(&key) {
                Some(&i) => {
                    let earlier = std::mem::replace(&mut rows[i], row);
                    merge_into(&mut rows[i], &earlier, dedupe_key, &UpsertOptions::default());
                }
                None => {
                    index.insert(key, rows.len());
                    rows.push(row);
                }
            },
        }
    }

    for mut record in records {
        let Some(key) = key_for(&mut record, dedupe_key) else {
            outcome.skipped_without_key += 1;
            continue;
        };
        match index.get(&key) {
            Some(&i) => {
                if merge_into(&mut rows[i], &record, dedupe_key, options) {
                    outcome.updated += 1;
                }
            }
            None => {
                index.insert(key, rows.len());
                rows.push(record);
                outcome.inserted += 1;
            }
        }
    }

    let mut merged = Table::new();
    merged.union_columns(&columns);
    merged.extend(rows);
    merged.sort_newest_first();
    *table = merged;
    outcome
}

#[derive(Debug, Clone)]
pub struct FileUpsert {
    pub outcome: UpsertOutcome,
    pub commit: CommitOutcome,
    pub recovered_from: Option<PathBuf>,
    pub rows_after: usize,
}

/// Load, merge and atomically commit one portal table. On error nothing was
/// committed and the caller still owns its records.
pub async fn upsert_file(
    store: &TableStore,
    path: &Path,
    records: Vec<NormalizedRecord>,
    dedupe_key: &str,
    options: &UpsertOptions,
) -> Result<FileUpsert, StoreError> {
    let mut loaded = store.load_for_merge(path).await?;
    let outcome = upsert(&mut loaded.table, records, dedupe_key, options);
    let commit = store.commit(&loaded.table, path).await?;
    Ok(FileUpsert {
        outcome,
        commit,
        recovered_from: loaded.recovered_from,
        rows_after: loaded.table.len(),
    })
}
