//! Durable table storage for jobhub: CSV codec, atomic writes, read retries,
//! a local cache mirror and quarantine of unreadable files.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use jobhub_core::{is_schema_column, normalize_column_name, NormalizedRecord, Table, MISSING_SENTINEL};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobhub-storage";

const PENDING_SUFFIX: &str = "pending";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a recognised table: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("refusing to use editor lock artifact {path}")]
    LockArtifact { path: PathBuf },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Temp files, office lock files and editor swap files are never tables.
pub fn is_lock_artifact(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with("~$")
        || name.starts_with(".~lock.")
        || name.starts_with(".#")
        || name.ends_with(".swp")
}

fn refuse_lock_artifact(path: &Path) -> Result<(), StoreError> {
    if is_lock_artifact(path) {
        return Err(StoreError::LockArtifact {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

/// Serialize a table with its header row. Missing cells are written as
/// [`MISSING_SENTINEL`].
pub fn encode_table(table: &Table) -> io::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(
            table
                .columns()
                .iter()
                .map(|c| row.get(c).unwrap_or(MISSING_SENTINEL)),
        )?;
    }
    writer.into_inner().map_err(|e| e.into_error())
}

/// Parse table bytes. Only UTF-8, rectangular CSV whose header names at least
/// one schema column is accepted; anything else is [`StoreError::Corrupt`].
pub fn decode_table(path: &Path, bytes: &[u8]) -> Result<Table, StoreError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(StoreError::corrupt(path, "empty file"));
    }
    std::str::from_utf8(bytes).map_err(|e| StoreError::corrupt(path, format!("not utf-8: {e}")))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| StoreError::corrupt(path, format!("unreadable header: {e}")))?
        .iter()
        .map(normalize_column_name)
        .collect();
    if !header.iter().any(|c| is_schema_column(c)) {
        return Err(StoreError::corrupt(path, "header names no known column"));
    }

    let mut table = Table::new();
    table.union_columns(
        &header
            .iter()
            .filter(|c| !c.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>(),
    );
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| StoreError::corrupt(path, format!("row {}: {e}", index + 1)))?;
        table.push(NormalizedRecord::from_cells(
            header.iter().map(String::as_str).zip(row.iter().map(Some)),
        ));
    }
    Ok(table)
}

/// Write via a uniquely named temp file in the target directory, then rename
/// over the target. Readers see the old or the new content, never a mix.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    refuse_lock_artifact(path)?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: Table,
    /// Path the table was read from and should be merged against.
    pub working_path: PathBuf,
    /// Set when an unreadable file was moved aside and an empty table returned.
    pub recovered_from: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Synced,
    /// The local mirror holds the new table; the remote copy will be pushed
    /// on the next load.
    LocalOnly { reason: String },
}

#[derive(Debug)]
pub struct TableStore {
    cache_dir: Option<PathBuf>,
    retry: BackoffPolicy,
    last_good: Mutex<HashMap<PathBuf, Table>>,
}

impl TableStore {
    pub fn new(cache_dir: Option<PathBuf>, retry: BackoffPolicy) -> Self {
        Self {
            cache_dir,
            retry,
            last_good: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn local_mirror_for(&self, remote: &Path) -> Option<PathBuf> {
        let name = remote.file_name()?;
        self.cache_dir.as_ref().map(|dir| dir.join(name))
    }

    async fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        let mut attempt = 0;
        loop {
            match fs::read(path).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) if attempt < self.retry.max_retries => {
                    warn!(path = %path.display(), attempt, error = %err, "table read failed, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(StoreError::io(path, err)),
            }
        }
    }

    /// `Ok(None)` when the file does not exist yet.
    pub async fn read_table(&self, path: &Path) -> Result<Option<Table>, StoreError> {
        refuse_lock_artifact(path)?;
        match self.read_bytes(path).await? {
            Some(bytes) => decode_table(path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save(&self, path: &Path, table: &Table) -> Result<(), StoreError> {
        refuse_lock_artifact(path)?;
        let bytes = encode_table(table).map_err(|e| StoreError::io(path, e))?;
        write_bytes_atomic(path, &bytes).await
    }

    /// Move an unreadable file aside as `<file>.corrupted_<timestamp>`.
    pub async fn quarantine(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut target = with_suffix(path, &format!("corrupted_{stamp}"));
        let mut n = 1;
        while fs::try_exists(&target).await.unwrap_or(false) {
            target = with_suffix(path, &format!("corrupted_{stamp}_{n}"));
            n += 1;
        }
        fs::rename(path, &target)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        warn!(from = %path.display(), to = %target.display(), "quarantined unreadable table");
        Ok(target)
    }

    async fn copy_atomic(&self, from: &Path, to: &Path) -> Result<bool, StoreError> {
        match self.read_bytes(from).await? {
            Some(bytes) => {
                write_bytes_atomic(to, &bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load the table a merge should start from. With a cache dir the remote
    /// table is mirrored locally first, unless a pending marker says the local
    /// mirror is newer, in which case the mirror is pushed to the remote.
    /// A corrupt table is quarantined and an empty one returned. A remote that
    /// cannot be read and has no cached copy is an error.
    pub async fn load_for_merge(&self, remote: &Path) -> Result<LoadedTable, StoreError> {
        refuse_lock_artifact(remote)?;
        let working_path = match self.local_mirror_for(remote) {
            Some(local) => {
                self.sync_mirror(remote, &local).await?;
                local
            }
            None => remote.to_path_buf(),
        };

        match self.read_table(&working_path).await {
            Ok(table) => Ok(LoadedTable {
                table: table.unwrap_or_default(),
                working_path,
                recovered_from: None,
            }),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(path = %working_path.display(), %reason, "table unreadable, starting empty");
                let moved = self.quarantine(&working_path).await?;
                if working_path != remote {
                    self.quarantine_if_corrupt(remote).await;
                }
                Ok(LoadedTable {
                    table: Table::new(),
                    working_path,
                    recovered_from: Some(moved),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn sync_mirror(&self, remote: &Path, local: &Path) -> Result<(), StoreError> {
        let marker = with_suffix(local, PENDING_SUFFIX);
        if fs::try_exists(&marker).await.unwrap_or(false) {
            if !fs::try_exists(local).await.unwrap_or(false) {
                let _ = fs::remove_file(&marker).await;
            } else {
                match self.copy_atomic(local, remote).await {
                    Ok(_) => {
                        let _ = fs::remove_file(&marker).await;
                        info!(remote = %remote.display(), "pushed pending local table to remote");
                    }
                    Err(err) => {
                        warn!(remote = %remote.display(), error = %err, "remote still unavailable, keeping local table");
                    }
                }
                return Ok(());
            }
        }

        let err = match self.copy_atomic(remote, local).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        // Without a cached copy an unreadable remote must not look empty.
        if err.is_transient() && fs::try_exists(local).await.unwrap_or(false) {
            warn!(remote = %remote.display(), error = %err, "could not refresh local mirror, using cached copy");
            return Ok(());
        }
        Err(err)
    }

    /// Move `path` aside only if it exists and does not decode.
    async fn quarantine_if_corrupt(&self, path: &Path) {
        if let Err(StoreError::Corrupt { .. }) = self.read_table(path).await {
            if let Err(err) = self.quarantine(path).await {
                warn!(path = %path.display(), error = %err, "could not quarantine unreadable table");
            }
        }
    }

    /// Persist a merged table. Without a cache dir this is one atomic write.
    /// With one, the local mirror is written first and a failed remote write
    /// leaves a pending marker instead of failing the commit.
    pub async fn commit(&self, table: &Table, remote: &Path) -> Result<CommitOutcome, StoreError> {
        refuse_lock_artifact(remote)?;
        let bytes = encode_table(table).map_err(|e| StoreError::io(remote, e))?;
        let Some(local) = self.local_mirror_for(remote) else {
            write_bytes_atomic(remote, &bytes).await?;
            return Ok(CommitOutcome::Synced);
        };

        write_bytes_atomic(&local, &bytes).await?;
        let marker = with_suffix(&local, PENDING_SUFFIX);
        match write_bytes_atomic(remote, &bytes).await {
            Ok(()) => {
                let _ = fs::remove_file(&marker).await;
                Ok(CommitOutcome::Synced)
            }
            Err(err) => {
                warn!(remote = %remote.display(), error = %err, "remote write failed, local table kept");
                if let Err(marker_err) = fs::write(&marker, remote.display().to_string()).await {
                    warn!(marker = %marker.display(), error = %marker_err, "could not record pending push");
                }
                Ok(CommitOutcome::LocalOnly {
                    reason: err.to_string(),
                })
            }
        }
    }

    pub async fn has_pending_push(&self, remote: &Path) -> bool {
        match self.local_mirror_for(remote) {
            Some(local) => fs::try_exists(with_suffix(&local, PENDING_SUFFIX))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    /// The copy a read-only consumer should use: the local mirror while a
    /// push to the remote is pending, the remote otherwise.
    pub async fn read_path_for(&self, remote: &Path) -> PathBuf {
        match self.local_mirror_for(remote) {
            Some(local) if self.has_pending_push(remote).await => local,
            _ => remote.to_path_buf(),
        }
    }

    /// For readers that must keep serving while a file is unreadable: returns
    /// the last table successfully loaded from `path` when a reload fails.
    pub async fn load_with_fallback(&self, path: &Path) -> Result<Table, StoreError> {
        let mut last_good = self.last_good.lock().await;
        match self.read_table(path).await {
            Ok(Some(table)) => {
                last_good.insert(path.to_path_buf(), table.clone());
                Ok(table)
            }
            Ok(None) => Ok(last_good.get(path).cloned().unwrap_or_default()),
            Err(err) => match last_good.get(path) {
                Some(table) => {
                    warn!(path = %path.display(), error = %err, "serving last good table");
                    Ok(table.clone())
                }
                None => Err(err),
            },
        }
    }
}
