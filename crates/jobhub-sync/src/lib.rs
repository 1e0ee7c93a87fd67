//! Merge engine, cross-portal master, taxonomy backfill, quality report and
//! the pipeline that runs them per cycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobhub_adapters::SourceSpec;
use jobhub_storage::{BackoffPolicy, TableStore};
use serde::Deserialize;

mod backfill;
mod master;
mod merge;
mod pipeline;
mod report;

pub use backfill::{backfill, backfill_file, fill_taxonomy_gaps, BackfillCounts};
pub use master::{build_master, MasterStats, MASTER_BUILT_AT_COLUMN};
pub use merge::{upsert, upsert_file, FileUpsert, UpsertOptions, UpsertOutcome};
pub use pipeline::{shutdown_on_ctrl_c, CycleSummary, Pipeline, PortalRunSummary};
pub use report::{assess, render_brief, ColumnMissing, QualityReport, TableQuality};

pub const CRATE_NAME: &str = "jobhub-sync";

pub const MASTER_FILE: &str = "jobs_master.csv";
pub const MASTER_LOCAL_FILE: &str = "jobs_master_local.csv";
pub const QUALITY_REPORT_FILE: &str = "portal_quality_report.json";
pub const QUALITY_BRIEF_FILE: &str = "quality_brief.md";

pub const MIN_WATCH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(600);

pub fn clamp_watch_interval(interval: Duration) -> Duration {
    interval.max(MIN_WATCH_INTERVAL)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
    pub watch_interval: Duration,
    pub read_retry: BackoffPolicy,
    pub web_port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = BackoffPolicy::default();
        Self {
            data_dir: var("JOBHUB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            cache_dir: var("JOBHUB_CACHE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            workspace_root: var("JOBHUB_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            watch_interval: clamp_watch_interval(
                number("JOBHUB_WATCH_INTERVAL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_WATCH_INTERVAL),
            ),
            read_retry: BackoffPolicy {
                max_retries: number("JOBHUB_READ_RETRIES")
                    .map(|n| n as usize)
                    .unwrap_or(defaults.max_retries),
                base_delay: number("JOBHUB_READ_RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: defaults.max_delay,
            },
            web_port: var("JOBHUB_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Defaults rooted at `data_dir`, without a cache mirror.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            workspace_root: data_dir.clone(),
            data_dir,
            ..Self::from_vars(|_| None)
        }
    }

    pub fn table_store(&self) -> TableStore {
        TableStore::new(self.cache_dir.clone(), self.read_retry)
    }

    pub fn portal_table_path(&self, portal: &PortalConfig) -> PathBuf {
        self.data_dir.join(portal.output_file())
    }

    pub fn master_path(&self) -> PathBuf {
        self.data_dir.join(MASTER_FILE)
    }

    pub fn master_local_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(MASTER_LOCAL_FILE))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalRegistry {
    pub portals: Vec<PortalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Table file under the data dir; `<name>_jobs.csv` when unset.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub source: SourceSpec,
    #[serde(default = "default_dedupe_key")]
    pub dedupe_key: String,
    #[serde(default = "default_autosave_every")]
    pub autosave_every: usize,
    #[serde(default)]
    pub update_columns: Option<Vec<String>>,
    #[serde(default)]
    pub overwrite_existing: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_dedupe_key() -> String {
    jobhub_core::KEY_COLUMN.to_string()
}

fn default_autosave_every() -> usize {
    5
}

impl PortalConfig {
    pub fn output_file(&self) -> String {
        self.output
            .clone()
            .unwrap_or_else(|| format!("{}_jobs.csv", self.name))
    }

    pub fn upsert_options(&self) -> UpsertOptions {
        UpsertOptions {
            update_columns: self.update_columns.clone(),
            overwrite_existing: self.overwrite_existing,
        }
    }
}

impl PortalRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing portal registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("portals.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `all` selects every enabled portal; a name selects that portal even
    /// when it is disabled.
    pub fn select(&self, selector: &str) -> Result<Vec<&PortalConfig>> {
        if selector.eq_ignore_ascii_case("all") {
            return Ok(self.portals.iter().filter(|p| p.enabled).collect());
        }
        match self
            .portals
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(selector))
        {
            Some(portal) => Ok(vec![portal]),
            None => bail!("unknown portal {selector:?}"),
        }
    }
}
