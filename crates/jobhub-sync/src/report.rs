//! Data quality report: how sparse each portal table and the master are.

use chrono::{DateTime, Utc};
use jobhub_core::{Table, CORE_COLUMNS};
use serde::Serialize;

/// Share of missing cells above which a column counts as sparse.
pub const SPARSE_COLUMN_PCT: f64 = 70.0;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnMissing {
    pub column: String,
    pub missing_count: usize,
    pub missing_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableQuality {
    pub table: String,
    pub rows: usize,
    pub columns: usize,
    pub overall_sparsity_pct: f64,
    pub core_sparsity_pct: f64,
    pub optional_sparsity_pct: f64,
    pub sparse_columns: usize,
    /// Most-missing columns first.
    pub missing_by_column: Vec<ColumnMissing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub generated_at: DateTime<Utc>,
    pub tables: Vec<TableQuality>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn sparsity(table: &Table, columns: &[&str]) -> f64 {
    let cells = table.len() * columns.len();
    if cells == 0 {
        return 0.0;
    }
    let missing: usize = columns.iter().map(|c| table.missing_count(c)).sum();
    round2(missing as f64 * 100.0 / cells as f64)
}

pub fn assess(name: &str, table: &Table) -> TableQuality {
    let all: Vec<&str> = table.columns().iter().map(String::as_str).collect();
    let core: Vec<&str> = all
        .iter()
        .copied()
        .filter(|c| CORE_COLUMNS.contains(c))
        .collect();
    let optional: Vec<&str> = all
        .iter()
        .copied()
        .filter(|c| !CORE_COLUMNS.contains(c))
        .collect();

    let mut missing_by_column: Vec<ColumnMissing> = all
        .iter()
        .map(|c| {
            let missing_count = table.missing_count(c);
            let missing_pct = if table.is_empty() {
                0.0
            } else {
                round2(missing_count as f64 * 100.0 / table.len() as f64)
            };
            ColumnMissing {
                column: c.to_string(),
                missing_count,
                missing_pct,
            }
        })
        .collect();
    missing_by_column.sort_by(|a, b| b.missing_count.cmp(&a.missing_count));

    TableQuality {
        table: name.to_string(),
        rows: table.len(),
        columns: all.len(),
        overall_sparsity_pct: sparsity(table, &all),
        core_sparsity_pct: sparsity(table, &core),
        optional_sparsity_pct: sparsity(table, &optional),
        sparse_columns: missing_by_column
            .iter()
            .filter(|m| m.missing_pct > SPARSE_COLUMN_PCT)
            .count(),
        missing_by_column,
    }
}

pub fn render_brief(report: &QualityReport) -> String {
    let mut lines = vec![
        "# Portal Quality Brief".to_string(),
        String::new(),
        format!("- Generated: {}", report.generated_at),
        String::new(),
        "| table | rows | columns | overall % | core % | optional % | sparse columns |".to_string(),
        "|---|---|---|---|---|---|---|".to_string(),
    ];
    for t in &report.tables {
        lines.push(format!(
            "| {} | {} | {} | {:.2} | {:.2} | {:.2} | {} |",
            t.table,
            t.rows,
            t.columns,
            t.overall_sparsity_pct,
            t.core_sparsity_pct,
            t.optional_sparsity_pct,
            t.sparse_columns
        ));
    }
    for t in &report.tables {
        lines.push(String::new());
        lines.push(format!("## {}", t.table));
        for m in t.missing_by_column.iter().take(5) {
            lines.push(format!(
                "- {}: {} missing ({:.2}%)",
                m.column, m.missing_count, m.missing_pct
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}
