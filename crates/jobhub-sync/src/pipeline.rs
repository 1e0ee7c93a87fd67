//! Per-cycle orchestration: portals first, then the master table, the taxonomy
//! backfill and the quality report.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobhub_adapters::{source_for_portal, KeyFallback, RecordSource};
use jobhub_core::{assign_key, normalize, stamp_fingerprint, NormalizedRecord, Table};
use jobhub_storage::{write_bytes_atomic, CommitOutcome, StoreError, TableStore};
use jobhub_taxonomy::Classifier;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backfill::{backfill_file, BackfillCounts};
use crate::master::{build_master, MasterStats};
use crate::merge::{upsert_file, UpsertOptions};
use crate::report::{assess, render_brief, QualityReport};
use crate::{
    clamp_watch_interval, PipelineConfig, PortalConfig, PortalRegistry, QUALITY_BRIEF_FILE,
    QUALITY_REPORT_FILE,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortalRunSummary {
    pub portal: String,
    pub collected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_without_key: usize,
    pub flushes: usize,
    pub local_only_commits: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub portals: Vec<PortalRunSummary>,
    pub failed_portals: Vec<String>,
    pub master: Option<MasterStats>,
    pub backfill: Vec<(String, BackfillCounts)>,
    pub quality_report: Option<PathBuf>,
    pub interrupted: bool,
}

/// The first signal from `next_signal` flips `tx` to `true`. Returns `true`
/// once a second signal arrives.
async fn relay_interrupts<F, Fut>(mut next_signal: F, tx: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if next_signal().await.is_err() {
        return false;
    }
    warn!("interrupt received, flushing buffered rows; interrupt again to exit now");
    let _ = tx.send(true);
    next_signal().await.is_ok()
}

/// Receiver flips to `true` on the first Ctrl-C; a second Ctrl-C exits the
/// process without waiting for the flush.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if relay_interrupts(tokio::signal::ctrl_c, tx).await {
            warn!("second interrupt, exiting");
            std::process::exit(130);
        }
    });
    rx
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: PortalRegistry,
    store: TableStore,
    classifier: Classifier,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, registry: PortalRegistry, classifier: Classifier) -> Self {
        let store = config.table_store();
        Self {
            config,
            registry,
            store,
            classifier,
        }
    }

    /// Registry and taxonomy rules are read from the workspace root.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = PortalRegistry::load(&config.workspace_root).await?;
        let classifier = Classifier::from_workspace_root(&config.workspace_root).await?;
        Ok(Self::new(config, registry, classifier))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PortalRegistry {
        &self.registry
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    async fn flush(
        &self,
        portal: &PortalConfig,
        path: &Path,
        options: &UpsertOptions,
        buffer: &mut Vec<NormalizedRecord>,
        summary: &mut PortalRunSummary,
    ) -> Result<(), StoreError> {
        let rows = buffer.len();
        match upsert_file(&self.store, path, buffer.clone(), &portal.dedupe_key, options).await {
            Ok(result) => {
                buffer.clear();
                summary.flushes += 1;
                summary.inserted += result.outcome.inserted;
                summary.updated += result.outcome.updated;
                summary.skipped_without_key += result.outcome.skipped_without_key;
                if result.outcome.skipped_without_key > 0 {
                    warn!(portal = %portal.name, skipped = result.outcome.skipped_without_key, "rows without a dedupe key were dropped");
                }
                if let CommitOutcome::LocalOnly { reason } = &result.commit {
                    summary.local_only_commits += 1;
                    warn!(portal = %portal.name, %reason, "saved to local cache only");
                }
                info!(
                    portal = %portal.name,
                    rows,
                    inserted = result.outcome.inserted,
                    updated = result.outcome.updated,
                    table_rows = result.rows_after,
                    "autosave flush"
                );
                Ok(())
            }
            Err(err) => {
                warn!(portal = %portal.name, rows, error = %err, "flush failed, rows stay buffered");
                Err(err)
            }
        }
    }

    /// Collect one batch and merge it into the portal table, flushing every
    /// `autosave_every` rows. An interrupt stops collection and flushes what
    /// is buffered. The source is acknowledged only after everything landed.
    pub async fn run_portal_once(
        &self,
        portal: &PortalConfig,
        source: &dyn RecordSource,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PortalRunSummary> {
        let batch = source
            .collect()
            .await
            .with_context(|| format!("collecting records for {}", portal.name))?;
        let path = self.config.portal_table_path(portal);
        let options = portal.upsert_options();
        let autosave_every = portal.autosave_every.max(1);
        let fallback = source.key_fallback();

        let mut summary = PortalRunSummary {
            portal: portal.name.clone(),
            collected: batch.records.len(),
            ..Default::default()
        };
        let mut buffer = Vec::with_capacity(autosave_every);

        for (row_index, raw) in batch.records.iter().enumerate() {
            if *shutdown.borrow() {
                summary.interrupted = true;
                break;
            }
            let mut record = normalize(raw, &portal.name);
            if let KeyFallback::Fingerprint { scheme } = &fallback {
                stamp_fingerprint(&mut record, scheme, &batch.label, row_index);
            }
            assign_key(&mut record);
            buffer.push(record);

            if buffer.len() >= autosave_every {
                // On failure the rows stay buffered for the next flush.
                let _ = self
                    .flush(portal, &path, &options, &mut buffer, &mut summary)
                    .await;
            }
        }

        if !buffer.is_empty() {
            let pending = buffer.len();
            self.flush(portal, &path, &options, &mut buffer, &mut summary)
                .await
                .with_context(|| format!("final flush of {pending} rows for {}", portal.name))?;
        }

        if summary.interrupted {
            info!(portal = %portal.name, "interrupted, source left unacknowledged");
            return Ok(summary);
        }
        if let Err(err) = source.acknowledge(&batch).await {
            warn!(portal = %portal.name, error = %err, "could not acknowledge source batch");
        }
        Ok(summary)
    }

    /// One pass over the selected portals followed by the post-cycle tasks.
    /// A failing portal or post-cycle task is logged and skipped.
    pub async fn run_cycle(
        &self,
        selector: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleSummary> {
        let cycle_id = Uuid::new_v4();
        let portals = self.registry.select(selector)?;

        async {
            let started_at = Utc::now();
            let mut summary = CycleSummary {
                cycle_id,
                started_at,
                finished_at: started_at,
                portals: Vec::new(),
                failed_portals: Vec::new(),
                master: None,
                backfill: Vec::new(),
                quality_report: None,
                interrupted: false,
            };

            for portal in portals {
                if *shutdown.borrow() {
                    summary.interrupted = true;
                    break;
                }
                let source = source_for_portal(&portal.name, &portal.source, &self.config.data_dir);
                match self.run_portal_once(portal, source.as_ref(), shutdown).await {
                    Ok(run) => {
                        let interrupted = run.interrupted;
                        summary.portals.push(run);
                        if interrupted {
                            summary.interrupted = true;
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(portal = %portal.name, error = ?err, "portal run failed");
                        summary.failed_portals.push(portal.name.clone());
                    }
                }
            }

            if !summary.interrupted {
                match self.write_master().await {
                    Ok(stats) => summary.master = Some(stats),
                    Err(err) => warn!(error = ?err, "master build failed"),
                }
                summary.backfill = self.backfill_portals().await;
                match self.write_quality_report().await {
                    Ok(_) => {
                        summary.quality_report = Some(self.config.data_dir.join(QUALITY_REPORT_FILE))
                    }
                    Err(err) => warn!(error = ?err, "quality report failed"),
                }
            }

            summary.finished_at = Utc::now();
            info!(
                portals = summary.portals.len(),
                failed = summary.failed_portals.len(),
                interrupted = summary.interrupted,
                "cycle finished"
            );
            Ok(summary)
        }
        .instrument(info_span!("cycle", %cycle_id))
        .await
    }

    /// Repeat cycles until interrupted. The interval never drops below the
    /// minimum watch interval.
    pub async fn watch(
        &self,
        selector: &str,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let interval = clamp_watch_interval(interval);
        loop {
            let summary = self.run_cycle(selector, &shutdown).await?;
            if summary.interrupted || *shutdown.borrow() {
                break;
            }
            info!(next_cycle_in_secs = interval.as_secs(), "waiting for next cycle");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("watch loop stopped");
        Ok(())
    }

    async fn load_portal_tables(&self) -> Vec<(String, Table)> {
        let mut tables = Vec::new();
        for portal in &self.registry.portals {
            let remote = self.config.portal_table_path(portal);
            let path = self.store.read_path_for(&remote).await;
            match self.store.read_table(&path).await {
                Ok(Some(table)) => tables.push((portal.name.clone(), table)),
                Ok(None) => {}
                Err(err) => {
                    warn!(portal = %portal.name, error = %err, "skipping unreadable portal table")
                }
            }
        }
        tables
    }

    /// Rebuild `jobs_master.csv` from every registered portal table, plus the
    /// local dashboard copy when a cache dir is configured.
    pub async fn write_master(&self) -> Result<MasterStats> {
        let tables = self.load_portal_tables().await;
        let (master, stats) = build_master(tables, &self.classifier, Utc::now());

        let path = self.config.master_path();
        self.store
            .save(&path, &master)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        if let Some(local) = self.config.master_local_path() {
            if let Err(err) = self.store.save(&local, &master).await {
                warn!(path = %local.display(), error = %err, "could not write local master copy");
            }
        }
        info!(
            input_rows = stats.input_rows,
            output_rows = stats.output_rows,
            duplicates_dropped = stats.duplicates_dropped,
            taxonomy_filled = stats.taxonomy_filled,
            "master built"
        );
        Ok(stats)
    }

    pub async fn backfill_portals(&self) -> Vec<(String, BackfillCounts)> {
        let mut results = Vec::new();
        for portal in &self.registry.portals {
            let path = self.config.portal_table_path(portal);
            match backfill_file(&self.store, &path, &self.classifier).await {
                Ok(counts) => results.push((portal.name.clone(), counts)),
                Err(err) => warn!(portal = %portal.name, error = %err, "backfill failed"),
            }
        }
        results
    }

    /// Assess every portal table and the master, then write the JSON report
    /// and markdown brief into the data dir.
    pub async fn write_quality_report(&self) -> Result<QualityReport> {
        let mut tables = Vec::new();
        for (name, table) in self.load_portal_tables().await {
            tables.push(assess(&name, &table));
        }
        let master_path = self.config.master_path();
        match self.store.read_table(&master_path).await {
            Ok(Some(master)) => tables.push(assess("master", &master)),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "master unreadable, left out of quality report"),
        }

        let report = QualityReport {
            generated_at: Utc::now(),
            tables,
        };
        let json = serde_json::to_vec_pretty(&report).context("serializing quality report")?;
        let json_path = self.config.data_dir.join(QUALITY_REPORT_FILE);
        write_bytes_atomic(&json_path, &json)
            .await
            .with_context(|| format!("writing {}", json_path.display()))?;
        let brief_path = self.config.data_dir.join(QUALITY_BRIEF_FILE);
        write_bytes_atomic(&brief_path, render_brief(&report).as_bytes())
            .await
            .with_context(|| format!("writing {}", brief_path.display()))?;
        Ok(report)
    }
}
