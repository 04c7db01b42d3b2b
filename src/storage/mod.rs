//! Persistent, time-versioned calibration table.
//!
//! The table is a single CSV file. Every save is a read-modify-write of the whole file
//! performed under an exclusive lock file (`<database>.lock`) and committed by writing
//! `<database>.tmp` and renaming it over the live file, so readers never see a partial
//! table and concurrent writers cannot drop each other's rows.
//!
//! Reads that fail (for example while another tool holds the file half-written) are
//! retried with exponential backoff for up to `retry_timeout`. A save that still cannot
//! parse the existing file moves it aside to `<database>.corrupt-<timestamp>` and starts
//! a fresh table; the event is logged at `error` level.

mod query;
mod table;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::analysis::ModelParameters;
use crate::error::{AppResult, IlluminationError};

pub use query::{
    select, CalibrationIndex, CalibrationRecord, IndexQuery, TimeSelector, DATE_FORMAT,
    KEY_COLUMNS, TIME_FORMAT,
};
pub use table::CalibrationTable;

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Retry and lock tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    /// Total time spent retrying lock acquisition or a failing read.
    pub retry_timeout: Duration,
    /// Age after which a leftover lock file is considered abandoned.
    pub stale_lock_age: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_secs(10),
            stale_lock_age: Duration::from_secs(120),
        }
    }
}

/// Handle to a calibration table file.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
    options: StoreOptions,
}

/// Removes the lock file when dropped.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), "failed to remove lock file: {}", e);
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl CalibrationStore {
    /// Store backed by `path` with default options.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, StoreOptions::default())
    }

    /// Store backed by `path`.
    pub fn with_options(path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    /// Location of the table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, ".lock")
    }

    /// Appends a calibration stamped with the current local time.
    pub async fn save(
        &self,
        index: &CalibrationIndex,
        parameters: &ModelParameters,
    ) -> AppResult<CalibrationRecord> {
        self.save_at(index, parameters, Local::now().naive_local())
            .await
    }

    /// Appends a calibration stamped with `timestamp` (truncated to the minute).
    ///
    /// A row with the same device, wavelength, laser power, date and time is replaced.
    pub async fn save_at(
        &self,
        index: &CalibrationIndex,
        parameters: &ModelParameters,
        timestamp: NaiveDateTime,
    ) -> AppResult<CalibrationRecord> {
        let time = timestamp
            .time()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| timestamp.time());
        let record = CalibrationRecord {
            device: index.device.clone(),
            wavelength: index.wavelength,
            laser_power: index.laser_power,
            date: timestamp.date(),
            time,
            parameters: parameters
                .iter()
                .filter(|(_, v)| !v.is_nan())
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };

        let _lock = self.acquire_lock().await?;
        let mut table = match self.read_with_retry().await {
            Ok(Some(table)) => table,
            Ok(None) => CalibrationTable::new(),
            Err(e) => {
                let quarantined = self.quarantine().await?;
                error!(
                    database = %self.path.display(),
                    moved_to = %quarantined.display(),
                    "calibration table unreadable ({}); starting a fresh table",
                    e
                );
                CalibrationTable::new()
            }
        };
        table.upsert(record.clone());
        self.write_table(&table).await?;

        info!(
            device = %record.device,
            wavelength = record.wavelength,
            laser_power = record.laser_power,
            date = %record.date,
            time = %record.time.format(TIME_FORMAT),
            "saved calibration"
        );
        Ok(record)
    }

    /// Rows matching `query`, folded over time according to `selector`.
    pub async fn load(
        &self,
        query: &IndexQuery,
        selector: &TimeSelector,
    ) -> AppResult<Vec<CalibrationRecord>> {
        let table = self.read_table().await?;
        select(table.records(), query, selector)
    }

    /// The whole table. Fails with [`IlluminationError::NotFound`] if the file is missing.
    pub async fn read_table(&self) -> AppResult<CalibrationTable> {
        self.read_with_retry().await?.ok_or_else(|| {
            IlluminationError::NotFound(format!(
                "calibration database {} does not exist",
                self.path.display()
            ))
        })
    }

    /// Compacts the history using today's date for the backup name.
    pub async fn restart(&self) -> AppResult<PathBuf> {
        self.restart_on(Local::now().date_naive()).await
    }

    /// Copies the table to `<stem>_<date>.<ext>` and replaces the live table with the
    /// latest row per device, wavelength and laser power.
    ///
    /// Fails with [`IlluminationError::BackupExists`] rather than overwrite a backup.
    pub async fn restart_on(&self, date: NaiveDate) -> AppResult<PathBuf> {
        let backup = self.backup_path(date);

        let _lock = self.acquire_lock().await?;
        let table = self.read_table().await?;
        let original = tokio::fs::read(&self.path).await?;
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&backup)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(IlluminationError::BackupExists(backup));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&original).await?;
        file.flush().await?;
        let compacted = table.compacted();
        self.write_table(&compacted).await?;

        info!(
            database = %self.path.display(),
            backup = %backup.display(),
            before = table.len(),
            after = compacted.len(),
            "compacted calibration history"
        );
        Ok(backup)
    }

    fn backup_path(&self, date: NaiveDate) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "calibration".to_string());
        let name = match self.path.extension() {
            Some(ext) => format!("{}_{}.{}", stem, date.format(DATE_FORMAT), ext.to_string_lossy()),
            None => format!("{}_{}", stem, date.format(DATE_FORMAT)),
        };
        self.path.with_file_name(name)
    }

    /// `Ok(None)` if the file does not exist.
    async fn read_with_retry(&self) -> AppResult<Option<CalibrationTable>> {
        let deadline = Instant::now() + self.options.retry_timeout;
        let mut delay = INITIAL_BACKOFF;
        loop {
            let attempt = match tokio::fs::read(&self.path).await {
                Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                    Ok(Some(CalibrationTable::new()))
                }
                Ok(bytes) => CalibrationTable::from_csv(&bytes).map(Some),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => Err(e.into()),
            };
            match attempt {
                Ok(table) => return Ok(table),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(e) => {
                    debug!(database = %self.path.display(), "read failed, retrying: {}", e);
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn write_table(&self, table: &CalibrationTable) -> AppResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = sibling(&self.path, ".tmp");
        tokio::fs::write(&tmp, table.to_csv()?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn quarantine(&self) -> AppResult<PathBuf> {
        let stamp = Local::now().format("%Y%m%dT%H%M%S");
        let target = sibling(&self.path, &format!(".corrupt-{}", stamp));
        tokio::fs::rename(&self.path, &target).await?;
        Ok(target)
    }

    async fn acquire_lock(&self) -> AppResult<LockGuard> {
        let lock = self.lock_path();
        if let Some(dir) = lock.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let deadline = Instant::now() + self.options.retry_timeout;
        let mut delay = INITIAL_BACKOFF;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
                .await
            {
                Ok(mut file) => {
                    file.write_all(format!("{}\n", std::process::id()).as_bytes())
                        .await?;
                    return Ok(LockGuard { path: lock });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&lock).await {
                        warn!(lock = %lock.display(), "breaking stale calibration lock");
                        if let Err(e) = tokio::fs::remove_file(&lock).await {
                            debug!("stale lock already gone: {}", e);
                        }
                        continue;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(IlluminationError::StorageBusy(self.path.clone()));
                    }
                    sleep(delay.min(deadline - now)).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn lock_is_stale(&self, lock: &Path) -> bool {
        let modified = match tokio::fs::metadata(lock).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map_or(false, |age| age > self.options.stale_lock_age)
    }
}
