//! Record sources: the seam between scraper collaborators and the merge pipeline.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use jobhub_core::{normalize_column_name, RawRecord};
use jobhub_storage::is_lock_artifact;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobhub-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl AdapterError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// How records without a URL or id get their identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFallback {
    /// `source:title:company:location`.
    Composite,
    /// Content fingerprint under the given URL scheme, with row index mixed in.
    Fingerprint { scheme: String },
}

/// Records one collection produced, in the order the source emitted them.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    /// Mixed into content fingerprints.
    pub label: String,
    pub records: Vec<RawRecord>,
    pub origin_files: Vec<PathBuf>,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn portal(&self) -> &str;

    fn key_fallback(&self) -> KeyFallback {
        KeyFallback::Composite
    }

    async fn collect(&self) -> Result<SourceBatch, AdapterError>;

    /// Called once every record of `batch` has been persisted.
    async fn acknowledge(&self, _batch: &SourceBatch) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnOverrides {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub date: Option<String>,
    pub description: Option<String>,
}

/// Source section of a portal entry in `portals.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    JsonDrop {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    Export {
        dir: PathBuf,
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default)]
        columns: ColumnOverrides,
    },
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self::JsonDrop { dir: None }
    }
}

fn default_scheme() -> String {
    "linkedin".to_string()
}

/// Relative directories resolve against the data directory.
pub fn source_for_portal(portal: &str, spec: &SourceSpec, data_dir: &Path) -> Box<dyn RecordSource> {
    let resolve = |dir: &Path| {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            data_dir.join(dir)
        }
    };
    match spec {
        SourceSpec::JsonDrop { dir } => Box::new(JsonDropSource::new(
            portal,
            dir.as_deref()
                .map(resolve)
                .unwrap_or_else(|| data_dir.join("inbox").join(portal)),
        )),
        SourceSpec::Export {
            dir,
            scheme,
            columns,
        } => Box::new(ExportSource::new(portal, resolve(dir), scheme, columns.clone())),
    }
}

async fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, AdapterError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(AdapterError::io(dir, err)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AdapterError::io(dir, e))?
    {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        let wanted = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)));
        if !hidden && wanted && !is_lock_artifact(&path) && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Scraper collaborators drop `*.json` (array of objects or one object) or
/// `*.jsonl` files into an inbox directory per portal.
#[derive(Debug, Clone)]
pub struct JsonDropSource {
    portal: String,
    inbox: PathBuf,
}

impl JsonDropSource {
    pub fn new(portal: impl Into<String>, inbox: impl Into<PathBuf>) -> Self {
        Self {
            portal: portal.into(),
            inbox: inbox.into(),
        }
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    fn processed_dir(&self) -> PathBuf {
        self.inbox.join("processed")
    }
}

fn cell_from_json(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => {
            let joined = items
                .iter()
                .filter_map(cell_from_json)
                .collect::<Vec<_>>()
                .join(", ");
            Some(joined)
        }
        JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn record_from_json(path: &Path, value: &JsonValue) -> Result<RawRecord, AdapterError> {
    let JsonValue::Object(map) = value else {
        return Err(AdapterError::malformed(path, "expected a JSON object per record"));
    };
    let mut record = RawRecord::new();
    for (name, value) in map {
        record.insert(name.clone(), cell_from_json(value));
    }
    Ok(record)
}

pub fn parse_drop_file(path: &Path, text: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let is_lines = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));
    if is_lines {
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: JsonValue = serde_json::from_str(line)
                .map_err(|e| AdapterError::malformed(path, format!("line {}: {e}", index + 1)))?;
            records.push(record_from_json(path, &value)?);
        }
        return Ok(records);
    }

    let value: JsonValue =
        serde_json::from_str(text).map_err(|e| AdapterError::malformed(path, e.to_string()))?;
    match &value {
        JsonValue::Array(items) => items.iter().map(|v| record_from_json(path, v)).collect(),
        JsonValue::Object(_) => Ok(vec![record_from_json(path, &value)?]),
        _ => Err(AdapterError::malformed(path, "expected an array or an object")),
    }
}

#[async_trait]
impl RecordSource for JsonDropSource {
    fn portal(&self) -> &str {
        &self.portal
    }

    /// Unparseable files stay in the inbox for the next cycle.
    async fn collect(&self) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch {
            label: self.portal.clone(),
            ..Default::default()
        };
        for path in list_files(&self.inbox, &["json", "jsonl"]).await? {
            let text = fs::read_to_string(&path)
                .await
                .map_err(|e| AdapterError::io(&path, e))?;
            match parse_drop_file(&path, &text) {
                Ok(records) => {
                    batch.records.extend(records);
                    batch.origin_files.push(path);
                }
                Err(err) => warn!(portal = %self.portal, error = %err, "skipping drop file"),
            }
        }
        Ok(batch)
    }

    async fn acknowledge(&self, batch: &SourceBatch) -> Result<(), AdapterError> {
        let processed = self.processed_dir();
        fs::create_dir_all(&processed)
            .await
            .map_err(|e| AdapterError::io(&processed, e))?;
        for path in &batch.origin_files {
            let Some(name) = path.file_name() else {
                continue;
            };
            let mut target = processed.join(name);
            if fs::try_exists(&target).await.unwrap_or(false) {
                let stamp = Utc::now().format("%Y%m%d%H%M%S%f");
                target = processed.join(format!("{stamp}_{}", name.to_string_lossy()));
            }
            fs::rename(path, &target)
                .await
                .map_err(|e| AdapterError::io(path, e))?;
        }
        Ok(())
    }
}

struct ColumnRule {
    field: &'static str,
    exact: &'static [&'static str],
    patterns: &'static [&'static str],
}

const EXPORT_COLUMNS: &[ColumnRule] = &[
    ColumnRule {
        field: "title",
        exact: &["job title", "title", "position", "role", "job", "job_name"],
        patterns: &[r"(job[_\s-]*)?title\b", r"\bposition\b", r"\brole\b"],
    },
    ColumnRule {
        field: "company",
        exact: &["company", "company name", "organization", "employer", "company_name"],
        patterns: &[r"\bcompany\b", r"org(anization)?\b", r"\bemployer\b", r"firm\b"],
    },
    ColumnRule {
        field: "location",
        exact: &["location", "job location", "city", "job_location"],
        patterns: &[r"\blocation\b", r"\bcity\b", r"\bregion\b", r"\baddress\b"],
    },
    ColumnRule {
        field: "job_url",
        exact: &["job url", "url", "link", "job link", "job_link", "posting url", "posting link"],
        patterns: &[r"\burl\b", r"\blink\b", r"\bhref\b"],
    },
    ColumnRule {
        field: "posted_date",
        exact: &["date saved", "saved date", "saved on", "date", "created at", "time", "saved_at"],
        patterns: &[r"\bdate\b", r"\btime\b", r"created", r"saved", r"posted"],
    },
    ColumnRule {
        field: "description",
        exact: &["description", "job description", "details", "summary"],
        patterns: &[r"desc(ription)?", r"\bsummary\b", r"\bdetails\b"],
    },
];

/// Explicit override, then exact candidates, then the first column a
/// pattern matches.
pub fn pick_column(
    columns: &[String],
    explicit: Option<&str>,
    exact: &[&str],
    patterns: &[&str],
) -> Option<usize> {
    if let Some(explicit) = explicit {
        let wanted = normalize_column_name(explicit);
        if let Some(i) = columns.iter().position(|c| *c == wanted) {
            return Some(i);
        }
    }
    for candidate in exact {
        if let Some(i) = columns.iter().position(|c| c == candidate) {
            return Some(i);
        }
    }
    for pattern in patterns {
        let Ok(regex) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            continue;
        };
        if let Some(i) = columns.iter().position(|c| regex.is_match(c)) {
            return Some(i);
        }
    }
    None
}

/// Newest CSV export of saved postings from a professional network. Exports
/// rarely carry stable ids, so rows without a URL are fingerprinted.
#[derive(Debug, Clone)]
pub struct ExportSource {
    portal: String,
    dir: PathBuf,
    scheme: String,
    overrides: ColumnOverrides,
}

impl ExportSource {
    pub fn new(
        portal: impl Into<String>,
        dir: impl Into<PathBuf>,
        scheme: impl Into<String>,
        overrides: ColumnOverrides,
    ) -> Self {
        Self {
            portal: portal.into(),
            dir: dir.into(),
            scheme: scheme.into(),
            overrides,
        }
    }

    async fn newest_export(&self) -> Result<Option<PathBuf>, AdapterError> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in list_files(&self.dir, &["csv"]).await? {
            let modified = fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map_err(|e| AdapterError::io(&path, e))?;
            if newest.as_ref().map_or(true, |(t, _)| modified >= *t) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn explicit_for(&self, field: &str) -> Option<&str> {
        match field {
            "title" => self.overrides.title.as_deref(),
            "company" => self.overrides.company.as_deref(),
            "location" => self.overrides.location.as_deref(),
            "job_url" => self.overrides.url.as_deref(),
            "posted_date" => self.overrides.date.as_deref(),
            "description" => self.overrides.description.as_deref(),
            _ => None,
        }
    }
}

/// Exports are usually UTF-8; anything else is read as Latin-1.
fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    }
}

#[async_trait]
impl RecordSource for ExportSource {
    fn portal(&self) -> &str {
        &self.portal
    }

    fn key_fallback(&self) -> KeyFallback {
        KeyFallback::Fingerprint {
            scheme: self.scheme.clone(),
        }
    }

    async fn collect(&self) -> Result<SourceBatch, AdapterError> {
        let Some(path) = self.newest_export().await? else {
            info!(portal = %self.portal, dir = %self.dir.display(), "no export file found");
            return Ok(SourceBatch {
                label: self.portal.clone(),
                ..Default::default()
            });
        };
        let bytes = fs::read(&path).await.map_err(|e| AdapterError::io(&path, e))?;
        let text = decode_text(bytes);

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| AdapterError::malformed(&path, e.to_string()))?
            .iter()
            .map(normalize_column_name)
            .collect();

        let mapping: Vec<(&str, usize)> = EXPORT_COLUMNS
            .iter()
            .filter_map(|rule| {
                pick_column(&columns, self.explicit_for(rule.field), rule.exact, rule.patterns)
                    .map(|i| (rule.field, i))
            })
            .collect();
        info!(
            portal = %self.portal,
            file = %path.display(),
            mapping = ?mapping.iter().map(|(f, i)| (*f, columns[*i].as_str())).collect::<Vec<_>>(),
            "detected export columns"
        );

        let scraped_at = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut records = Vec::new();
        for (index, row) in reader.records().enumerate() {
            let row =
                row.map_err(|e| AdapterError::malformed(&path, format!("row {}: {e}", index + 1)))?;
            let mut record = RawRecord::new().with("scraped_at", scraped_at.clone());
            for (field, column) in &mapping {
                record.insert(*field, row.get(*column).map(str::to_string));
            }
            records.push(record);
        }

        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.portal.clone());
        Ok(SourceBatch {
            label,
            records,
            origin_files: vec![path],
        })
    }
}
