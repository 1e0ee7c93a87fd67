//! Core record model, missing-value handling, normalization and identity for jobhub.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "jobhub-core";

/// Literal written for a missing cell at the storage boundary.
pub const MISSING_SENTINEL: &str = "Non";

/// Column holding the resolved [`DedupeKey`].
pub const KEY_COLUMN: &str = "global_key";

pub const SCRAPED_AT_COLUMN: &str = "scraped_at";

pub const TAXONOMY_COLUMNS: [&str; 5] = [
    "category_primary",
    "domain_l1",
    "domain_l2",
    "domain_l3",
    "tax_confidence",
];

/// Columns every portal is expected to supply; used for quality reporting.
pub const CORE_COLUMNS: [&str; 8] = [
    "job_id",
    "title",
    "company",
    "location",
    "posted_date",
    "job_url",
    "source",
    "scraped_at",
];

/// Catch-all label used when a taxonomy level has nothing better to say.
pub const OTHER_LABEL: &str = "Other";

const PLACEHOLDERS: &[&str] = &[
    "", "non", "none", "na", "n/a", "-", "\u{2014}", "null", "nan", "<na>",
];

/// Older portal files used these names before the shared schema settled.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("it_non_it", "category_primary"),
    ("designation", "title"),
    ("onsite_hybrid_remote", "work_mode"),
    ("date_posted", "posted_date"),
    ("job_type", "employment_type"),
    ("level", "position"),
    ("salary_raw", "compensation"),
];

pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Trim a cell and collapse every placeholder spelling to `None`.
pub fn clean_cell(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if is_placeholder(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_column_name(name: &str) -> String {
    name.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// One scraped posting as a collaborator produced it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: BTreeMap<String, Option<String>>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }
}

macro_rules! schema_record {
    ($($field:ident => $column:literal),+ $(,)?) => {
        /// Schema-conformant posting. Every schema column is a field and `None`
        /// is the missing sentinel.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct NormalizedRecord {
            $(pub $field: Option<String>,)+
            /// Columns outside the fixed schema, kept so nothing read from disk is lost.
            pub extra: BTreeMap<String, Option<String>>,
        }

        /// Fixed column order shared by every portal table and the master table.
        pub const SCHEMA_COLUMNS: &[&str] = &[$($column),+];

        impl NormalizedRecord {
            pub fn get(&self, column: &str) -> Option<&str> {
                match column {
                    $($column => self.$field.as_deref(),)+
                    other => self.extra.get(other).and_then(|v| v.as_deref()),
                }
            }

            pub fn set(&mut self, column: &str, value: Option<String>) {
                match column {
                    $($column => self.$field = value,)+
                    other => {
                        self.extra.insert(other.to_string(), value);
                    }
                }
            }
        }
    };
}

schema_record! {
    global_key => "global_key",
    source => "source",
    job_id => "job_id",
    job_url => "job_url",
    title => "title",
    company => "company",
    company_link => "company_link",
    location => "location",
    country => "country",
    posted_date => "posted_date",
    num_applicants => "num_applicants",
    work_mode => "work_mode",
    employment_type => "employment_type",
    position => "position",
    kind => "type",
    compensation => "compensation",
    commitment => "commitment",
    skills => "skills",
    category_primary => "category_primary",
    domain_l1 => "domain_l1",
    domain_l2 => "domain_l2",
    domain_l3 => "domain_l3",
    tax_confidence => "tax_confidence",
    scraped_at => "scraped_at",
}

pub fn is_schema_column(name: &str) -> bool {
    SCHEMA_COLUMNS.contains(&name)
}

impl NormalizedRecord {
    /// Build a record from loosely named cells. Column names are normalized,
    /// placeholders become missing and legacy names are mapped onto the schema.
    pub fn from_cells<'a, I>(cells: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut record = Self::default();
        for (name, value) in cells {
            let column = normalize_column_name(name);
            if column.is_empty() {
                continue;
            }
            // Duplicate headers: the first non-missing value wins.
            if record.get(&column).is_some() {
                continue;
            }
            record.set(&column, value.and_then(clean_cell));
        }
        record.apply_legacy_aliases();
        record
    }

    fn apply_legacy_aliases(&mut self) {
        for (legacy, canonical) in LEGACY_ALIASES {
            if self.get(canonical).is_some() {
                continue;
            }
            if let Some(value) = self.get(legacy).map(str::to_string) {
                self.set(canonical, Some(value));
            }
        }
    }

    pub fn is_missing(&self, column: &str) -> bool {
        self.get(column).is_none()
    }

    /// Lower-case the source tag, falling back to the portal name when absent.
    pub fn ensure_source(&mut self, portal: &str) {
        let source = self
            .source
            .as_deref()
            .and_then(clean_cell)
            .or_else(|| clean_cell(portal))
            .map(|s| s.to_lowercase());
        self.source = source;
    }

    pub fn needs_taxonomy(&self) -> bool {
        TAXONOMY_COLUMNS.iter().any(|c| self.is_missing(c))
    }
}

/// Record Normalizer: map a raw scraper record onto the shared schema.
///
/// `scraped_at` is taken as given; a record that arrives without one stays
/// without one.
pub fn normalize(raw: &RawRecord, portal: &str) -> NormalizedRecord {
    let mut record = NormalizedRecord::from_cells(
        raw.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref())),
    );
    record.ensure_source(portal);
    record
}

/// Stable identity string for a real-world posting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn trimmed(value: Option<&str>) -> &str {
    value.map(str::trim).unwrap_or_default()
}

/// Identity Resolver. Priority: URL, then `source:job_id`, then the composite
/// `source:title:company:location`.
///
/// The composite can collide for identical openings at the same company and
/// location; two fully blank records also collide.
pub fn resolve_key(record: &NormalizedRecord) -> DedupeKey {
    let url = trimmed(record.job_url.as_deref());
    if !url.is_empty() {
        return DedupeKey(url.to_string());
    }

    let source = trimmed(record.source.as_deref()).to_lowercase();
    let job_id = trimmed(record.job_id.as_deref());
    if !source.is_empty() && !job_id.is_empty() {
        return DedupeKey(format!("{source}:{job_id}"));
    }

    let title = trimmed(record.title.as_deref()).to_lowercase();
    let company = trimmed(record.company.as_deref()).to_lowercase();
    let location = trimmed(record.location.as_deref()).to_lowercase();
    DedupeKey(
        format!("{source}:{title}:{company}:{location}")
            .trim_matches(':')
            .to_string(),
    )
}

/// Resolve the key and store it in [`KEY_COLUMN`].
pub fn assign_key(record: &mut NormalizedRecord) -> DedupeKey {
    let key = resolve_key(record);
    record.global_key = if key.is_empty() {
        None
    } else {
        Some(key.as_str().to_string())
    };
    key
}

/// Content fingerprint for rows from sources that carry no URL or id. The
/// batch label and row index are mixed in so sparse look-alike rows never
/// collapse into one key.
pub fn content_fingerprint(
    scheme: &str,
    batch_label: &str,
    row_index: usize,
    parts: &[Option<&str>],
) -> String {
    let joined = parts
        .iter()
        .flatten()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");
    let joined = if joined.is_empty() {
        "empty".to_string()
    } else {
        joined
    };

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(b" | ");
    hasher.update(batch_label.trim().to_lowercase().as_bytes());
    hasher.update(b" | ");
    hasher.update(row_index.to_string().as_bytes());
    format!("{scheme}://{}", hex::encode(hasher.finalize()))
}

/// Give an identifier-less record a fingerprint URL. Returns false when the
/// record already had a URL or id.
pub fn stamp_fingerprint(
    record: &mut NormalizedRecord,
    scheme: &str,
    batch_label: &str,
    row_index: usize,
) -> bool {
    if record.job_url.is_some() || record.job_id.is_some() {
        return false;
    }
    let description = record
        .get("description")
        .map(|d| d.chars().take(120).collect::<String>());
    let fingerprint = content_fingerprint(
        scheme,
        batch_label,
        row_index,
        &[
            record.title.as_deref(),
            record.company.as_deref(),
            record.location.as_deref(),
            record.posted_date.as_deref(),
            description.as_deref(),
        ],
    );
    record.job_url = Some(fingerprint);
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "IT")]
    It,
    #[serde(rename = "Non-IT")]
    NonIt,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::It => "IT",
            Category::NonIt => "Non-IT",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output for one posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyResult {
    pub category_primary: Category,
    pub domain_l1: String,
    pub domain_l2: Option<String>,
    pub domain_l3: Option<String>,
    pub tax_confidence: f64,
}

impl TaxonomyResult {
    /// Storage cells in [`TAXONOMY_COLUMNS`] order. Empty levels become
    /// [`OTHER_LABEL`] so backfilled rows never stay blank.
    pub fn filled(&self) -> [(&'static str, String); 5] {
        let level = |v: &Option<String>| {
            v.as_deref()
                .and_then(clean_cell)
                .unwrap_or_else(|| OTHER_LABEL.to_string())
        };
        [
            ("category_primary", self.category_primary.to_string()),
            ("domain_l1", self.domain_l1.clone()),
            ("domain_l2", level(&self.domain_l2)),
            ("domain_l3", level(&self.domain_l3)),
            ("tax_confidence", format!("{:.2}", self.tax_confidence)),
        ]
    }
}

/// Ordered table of normalized records. Schema columns always come first,
/// extension columns follow in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<NormalizedRecord>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            columns: SCHEMA_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = NormalizedRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.push(record);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[NormalizedRecord] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [NormalizedRecord] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<NormalizedRecord> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    pub fn union_columns<S: AsRef<str>>(&mut self, columns: &[S]) {
        for column in columns {
            self.ensure_column(column.as_ref());
        }
    }

    pub fn push(&mut self, record: NormalizedRecord) {
        for column in record.extra.keys() {
            if !self.has_column(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = NormalizedRecord>) {
        for record in records {
            self.push(record);
        }
    }

    pub fn set_rows(&mut self, rows: Vec<NormalizedRecord>) {
        self.rows.clear();
        self.extend(rows);
    }

    pub fn missing_count(&self, column: &str) -> usize {
        self.rows.iter().filter(|r| r.is_missing(column)).count()
    }

    /// Stable sort by `scraped_at`, newest first; unparseable values go last.
    pub fn sort_newest_first(&mut self) {
        self.rows.sort_by_cached_key(|r| {
            let parsed = r.scraped_at.as_deref().and_then(parse_timestamp);
            (parsed.is_none(), Reverse(parsed))
        });
    }
}

/// Parse the timestamp spellings found in portal files. Naive values are UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Ordering helper: `Greater` when `candidate` is strictly later than
/// `current`. `None` when either side does not parse.
pub fn compare_timestamps(candidate: &str, current: &str) -> Option<Ordering> {
    Some(parse_timestamp(candidate)?.cmp(&parse_timestamp(current)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: Option<&str>, source: &str, job_id: Option<&str>) -> NormalizedRecord {
        NormalizedRecord {
            job_url: url.map(str::to_string),
            source: Some(source.to_string()),
            job_id: job_id.map(str::to_string),
            title: Some("Data Engineer".into()),
            company: Some("Acme".into()),
            location: Some("Kathmandu".into()),
            ..Default::default()
        }
    }

    #[test]
    fn placeholders_collapse_to_missing() {
        for raw in ["", "  ", "Non", "NONE", "n/a", "NA", "-", "\u{2014}", "NULL", "nan", "<NA>"] {
            assert_eq!(clean_cell(raw), None, "{raw:?} should be missing");
        }
        assert_eq!(clean_cell("  Acme  ").as_deref(), Some("Acme"));
        assert_eq!(clean_cell("Nano").as_deref(), Some("Nano"));
    }

    #[test]
    fn normalizer_fills_schema_and_defaults_source() {
        let raw = RawRecord::new()
            .with("Title", " Backend Developer ")
            .with("company", "Non")
            .with("extra_note", "kept");
        let record = normalize(&raw, "MeroJob");

        assert_eq!(record.title.as_deref(), Some("Backend Developer"));
        assert_eq!(record.company, None);
        assert_eq!(record.source.as_deref(), Some("merojob"));
        assert_eq!(record.scraped_at, None);
        assert_eq!(record.get("extra_note"), Some("kept"));
        for column in SCHEMA_COLUMNS {
            let _ = record.get(column);
        }
    }

    #[test]
    fn normalizer_replaces_placeholder_source_and_lowercases() {
        let raw = RawRecord::new().with("source", " JobsNepal ");
        assert_eq!(normalize(&raw, "x").source.as_deref(), Some("jobsnepal"));

        let raw = RawRecord::new().with("source", "<NA>");
        assert_eq!(normalize(&raw, "Linkedin").source.as_deref(), Some("linkedin"));
    }

    #[test]
    fn legacy_aliases_only_fill_absent_canonical_fields() {
        let raw = RawRecord::new()
            .with("it_non_it", "IT")
            .with("designation", "Accountant")
            .with("title", "Senior Accountant");
        let record = normalize(&raw, "jobsnepal");
        assert_eq!(record.category_primary.as_deref(), Some("IT"));
        assert_eq!(record.title.as_deref(), Some("Senior Accountant"));
    }

    #[test]
    fn bom_and_case_in_column_names_are_normalized() {
        let record = NormalizedRecord::from_cells([("\u{feff}Job_URL", Some("https://x/1"))]);
        assert_eq!(record.job_url.as_deref(), Some("https://x/1"));
    }

    #[test]
    fn key_priority_chain() {
        let with_url = record(Some("https://x/1"), "p1", Some("9"));
        assert_eq!(resolve_key(&with_url).as_str(), "https://x/1");

        let with_id = record(None, "LinkedIn", Some("42"));
        assert_eq!(resolve_key(&with_id).as_str(), "linkedin:42");

        let composite = record(None, "p1", None);
        assert_eq!(
            resolve_key(&composite).as_str(),
            "p1:data engineer:acme:kathmandu"
        );
    }

    #[test]
    fn key_is_stable_across_incidental_whitespace_and_source_case() {
        let a = record(Some("https://x/1"), "p1", None);
        let b = record(Some("  https://x/1 \n"), "p1", None);
        assert_eq!(resolve_key(&a), resolve_key(&b));

        let c = record(None, "LinkedIn", Some(" 42 "));
        let d = record(None, " linkedin", Some("42"));
        assert_eq!(resolve_key(&c), resolve_key(&d));
    }

    #[test]
    fn composite_key_strips_empty_edges() {
        let sparse = NormalizedRecord {
            title: Some("Driver".into()),
            ..Default::default()
        };
        assert_eq!(resolve_key(&sparse).as_str(), "driver");
        assert!(resolve_key(&NormalizedRecord::default()).is_empty());
    }

    #[test]
    fn fingerprint_mixes_in_row_index() {
        let first = content_fingerprint("linkedin", "export.csv", 0, &[Some("Analyst")]);
        let second = content_fingerprint("linkedin", "export.csv", 1, &[Some("Analyst")]);
        let again = content_fingerprint("linkedin", "export.csv", 0, &[Some(" analyst ")]);
        assert_ne!(first, second);
        assert_eq!(first, again);
        assert!(first.starts_with("linkedin://"));
    }

    #[test]
    fn stamp_fingerprint_respects_existing_identifiers() {
        let mut with_id = record(None, "linkedin", Some("7"));
        assert!(!stamp_fingerprint(&mut with_id, "linkedin", "b", 0));
        assert_eq!(with_id.job_url, None);

        let mut bare = record(None, "linkedin", None);
        assert!(stamp_fingerprint(&mut bare, "linkedin", "b", 3));
        assert_eq!(resolve_key(&bare).as_str(), bare.job_url.as_deref().unwrap());
    }

    #[test]
    fn timestamps_parse_common_spellings() {
        assert!(parse_timestamp("2024-06-01T00:00:00").is_some());
        assert!(parse_timestamp("2024-06-01T00:00:00.123456").is_some());
        assert!(parse_timestamp("2024-06-01 08:30:00").is_some());
        assert!(parse_timestamp("2024-06-01T00:00:00Z").is_some());
        assert!(parse_timestamp("2024-06-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
        assert_eq!(
            compare_timestamps("2024-06-01T00:00:00", "2024-01-01T00:00:00"),
            Some(Ordering::Greater)
        );
        assert_eq!(compare_timestamps("garbage", "2024-01-01T00:00:00"), None);
    }

    #[test]
    fn table_keeps_schema_first_and_tracks_extension_columns() {
        let mut extra = NormalizedRecord::default();
        extra.set("industry", Some("Banking".into()));
        let table = Table::from_records([extra]);
        assert_eq!(&table.columns()[..SCHEMA_COLUMNS.len()], SCHEMA_COLUMNS);
        assert_eq!(table.columns().last().map(String::as_str), Some("industry"));
    }

    #[test]
    fn sort_puts_newest_first_and_unparseable_last() {
        let stamp = |s: &str| NormalizedRecord {
            scraped_at: Some(s.to_string()),
            ..Default::default()
        };
        let mut table = Table::from_records([
            stamp("2024-01-01T00:00:00"),
            stamp("not a date"),
            stamp("2024-06-01T00:00:00"),
        ]);
        table.sort_newest_first();
        let order: Vec<_> = table
            .rows()
            .iter()
            .map(|r| r.scraped_at.clone().unwrap())
            .collect();
        assert_eq!(
            order,
            vec!["2024-06-01T00:00:00", "2024-01-01T00:00:00", "not a date"]
        );
    }

    #[test]
    fn filled_taxonomy_never_leaves_levels_blank() {
        let result = TaxonomyResult {
            category_primary: Category::NonIt,
            domain_l1: "Sales".into(),
            domain_l2: None,
            domain_l3: Some("none".into()),
            tax_confidence: 0.5,
        };
        let cells = result.filled();
        assert_eq!(cells[2].1, "Other");
        assert_eq!(cells[3].1, "Other");
        assert_eq!(cells[4].1, "0.50");
    }
}
