//! Cross-portal master table: one row per real-world posting, newest scrape wins.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jobhub_core::{assign_key, Table};
use jobhub_taxonomy::Classifier;
use serde::Serialize;

use crate::backfill::fill_taxonomy_gaps;

pub const MASTER_BUILT_AT_COLUMN: &str = "master_built_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    pub input_rows: usize,
    pub output_rows: usize,
    pub duplicates_dropped: usize,
    pub taxonomy_filled: usize,
}

/// Combine per-portal tables. Keys are re-derived for every row so the same
/// posting seen by two portals collapses; after the newest occurrence is kept
/// a taxonomy pass fills whatever cells the survivor lacks.
pub fn build_master(
    portal_tables: Vec<(String, Table)>,
    classifier: &Classifier,
    built_at: DateTime<Utc>,
) -> (Table, MasterStats) {
    let mut stats = MasterStats::default();
    let mut combined = Table::new();
    for (portal, table) in portal_tables {
        combined.union_columns(table.columns());
        for mut row in table.into_rows() {
            row.ensure_source(&portal);
            assign_key(&mut row);
            combined.push(row);
            stats.input_rows += 1;
        }
    }
    combined.sort_newest_first();

    let columns = combined.columns().to_vec();
    let mut seen = HashSet::new();
    let mut master = Table::new();
    master.union_columns(&columns);
    for row in combined.into_rows() {
        let key = row.global_key.clone().unwrap_or_default();
        if !seen.insert(key) {
            stats.duplicates_dropped += 1;
            continue;
        }
        master.push(row);
    }

    let stamp = built_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    master.ensure_column(MASTER_BUILT_AT_COLUMN);
    for row in master.rows_mut() {
        if fill_taxonomy_gaps(row, classifier) == Some(true) {
            stats.taxonomy_filled += 1;
        }
        row.set(MASTER_BUILT_AT_COLUMN, Some(stamp.clone()));
    }
    stats.output_rows = master.len();
    (master, stats)
}
