//! Feed synchronization
//!
//! Pulls NVD bundles and OSV advisories, decides what changed and commits
//! the normalized rows. Stored sync state only ever advances after the rows
//! of a partition are committed, so an interrupted run can simply be
//! repeated.

use crate::archive;
use crate::change::ChangeDetector;
use crate::client::{FeedClient, FetchMode};
use crate::index::{parse_change_index, parse_instant, ChangeEntry};
use crate::limiter::WaitClock;
use crate::meta::NvdMeta;
use crate::nvd::parse_nvd_reader;
use crate::osv::parse_osv;
use chrono::{Datelike, Utc};
use governor::clock::DefaultClock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use vulnsync_common::checksum::{sha256_file, sha256_hex, verify_file_sha256};
use vulnsync_common::{Config, NvdFeedConfig, OsvFeedConfig};
use vulnsync_core::{CancellationToken, Error, OsvRows, Partition, Result, SyncState};
use vulnsync_store::{Store, SyncStateStore};

/// Upstream vulnerability feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Nvd,
    Osv,
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feed::Nvd => write!(f, "nvd"),
            Feed::Osv => write!(f, "osv"),
        }
    }
}

impl FromStr for Feed {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nvd" => Ok(Feed::Nvd),
            "osv" => Ok(Feed::Osv),
            other => Err(Error::Configuration(format!("Unknown feed: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Re-examine every partition (NVD) or ingest the whole archive (OSV)
    Full,
    /// Follow the recent-changes delta
    Recent,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Recent => write!(f, "recent"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "recent" => Ok(SyncMode::Recent),
            other => Err(Error::Configuration(format!("Unknown sync mode: {}", other))),
        }
    }
}

/// NVD run statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NvdSyncStats {
    /// The recent delta was unchanged; nothing was fetched beyond metadata
    pub up_to_date: bool,
    pub full_rescan: bool,
    pub partitions_checked: usize,
    /// Partitions committed in this run, in processing order
    pub partitions_synced: Vec<String>,
    pub cves: usize,
    pub cvss: usize,
}

/// OSV run statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsvSyncStats {
    pub total_entries: usize,
    pub updates_needed: usize,
    pub updates_successful: usize,
    pub updates_failed: usize,
    /// OSV records committed
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "feed", rename_all = "lowercase")]
pub enum SyncReport {
    Nvd(NvdSyncStats),
    Osv(OsvSyncStats),
}

/// Runs feed synchronizations against one store
///
/// Meant to be built once and shared: every run goes through the same
/// client and its rate limiter, and runs of one feed take turns since they
/// share that feed's work directory.
pub struct SyncOrchestrator<C: WaitClock = DefaultClock> {
    client: FeedClient<C>,
    store: Store,
    nvd: NvdFeedConfig,
    osv: OsvFeedConfig,
    cancel: CancellationToken,
    nvd_running: Mutex<()>,
    osv_running: Mutex<()>,
}

impl SyncOrchestrator<DefaultClock> {
    pub fn from_config(config: &Config, store: Store) -> Result<Self> {
        let client = FeedClient::new(&config.fetch)?;
        Ok(Self::new(client, store, config.nvd.clone(), config.osv.clone()))
    }
}

impl<C: WaitClock> SyncOrchestrator<C> {
    pub fn new(
        client: FeedClient<C>,
        store: Store,
        nvd: NvdFeedConfig,
        osv: OsvFeedConfig,
    ) -> Self {
        Self {
            client,
            store,
            nvd,
            osv,
            cancel: CancellationToken::new(),
            nvd_running: Mutex::new(()),
            osv_running: Mutex::new(()),
        }
    }

    /// Share `cancel` with the client and the store's upserts
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.client = self.client.with_cancellation(cancel.clone());
        self.store = self.store.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run_sync(&self, feed: Feed, mode: SyncMode) -> Result<SyncReport> {
        let span = info_span!("sync", feed = %feed, mode = %mode);
        async move {
            let running = match feed {
                Feed::Nvd => &self.nvd_running,
                Feed::Osv => &self.osv_running,
            };
            let _turn = match running.try_lock() {
                Ok(turn) => turn,
                Err(_) => {
                    info!("Another sync of this feed is running, waiting for it");
                    running.lock().await
                }
            };
            self.cancel.check("sync")?;

            info!("Starting sync");
            let report = match feed {
                Feed::Nvd => SyncReport::Nvd(self.sync_nvd(mode).await?),
                Feed::Osv => SyncReport::Osv(match mode {
                    SyncMode::Full => self.sync_osv_full().await?,
                    SyncMode::Recent => self.sync_osv_recent().await?,
                }),
            };
            info!("Sync complete");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    // === NVD ===

    async fn fetch_meta(&self, partition: Partition) -> Result<NvdMeta> {
        let text = self.client.fetch_text(&self.nvd.meta_url(&partition.key())).await?;
        NvdMeta::parse(&text)
    }

    /// Year partitions a full rescan examines
    fn tracked_years(&self) -> Result<BTreeSet<u16>> {
        let mut years: BTreeSet<u16> = self
            .store
            .sync_partitions()?
            .into_iter()
            .filter_map(|p| match p {
                Partition::Year(year) => Some(year),
                _ => None,
            })
            .collect();
        let current = u16::try_from(Utc::now().year()).unwrap_or(u16::MAX);
        years.extend(self.nvd.first_year..=current);
        Ok(years)
    }

    async fn sync_nvd(&self, mode: SyncMode) -> Result<NvdSyncStats> {
        let detector = ChangeDetector::new(&self.store, self.nvd.full_rescan_after_days);
        let mut stats = NvdSyncStats::default();

        let recent = self.fetch_meta(Partition::Recent).await?;
        stats.partitions_checked += 1;
        let recent_changed =
            detector.needs_update(Partition::Recent, recent.last_modified, &recent.sha256)?;

        if mode == SyncMode::Recent && !recent_changed {
            info!(last_modified = %recent.last_modified, "NVD recent feed unchanged");
            stats.up_to_date = true;
            return Ok(stats);
        }

        stats.full_rescan = mode == SyncMode::Full
            || detector.needs_full_rescan(detector.last_overall_sync()?, recent.last_modified);

        let mut changed: Vec<(Partition, NvdMeta)> = Vec::new();
        if stats.full_rescan {
            let years = self.tracked_years()?;
            info!(partitions = years.len(), "Full NVD rescan");
            for year in years {
                self.cancel.check("nvd partition scan")?;
                let partition = Partition::Year(year);
                let meta = self.fetch_meta(partition).await?;
                stats.partitions_checked += 1;
                if detector.needs_update(partition, meta.last_modified, &meta.sha256)? {
                    changed.push((partition, meta));
                } else {
                    debug!(partition = %partition, "Partition unchanged");
                }
            }
        }
        if recent_changed {
            changed.push((Partition::Recent, recent));
        }

        for (partition, meta) in changed {
            self.cancel.check("nvd sync")?;
            match self.ingest_nvd_partition(partition, &meta).await {
                Ok((cves, cvss)) => {
                    stats.cves += cves;
                    stats.cvss += cvss;
                    stats.partitions_synced.push(partition.key());
                }
                Err(e) => {
                    error!(
                        partition = %partition,
                        code = e.code(),
                        "Aborting NVD sync: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            partitions = stats.partitions_synced.len(),
            cves = stats.cves,
            cvss = stats.cvss,
            "NVD sync finished"
        );
        Ok(stats)
    }

    /// Download, verify and commit one bundle; returns (CVE rows, CVSS rows)
    ///
    /// Downloaded files are only removed after the partition committed.
    async fn ingest_nvd_partition(
        &self,
        partition: Partition,
        meta: &NvdMeta,
    ) -> Result<(usize, usize)> {
        let key = partition.key();
        tokio::fs::create_dir_all(&self.nvd.work_dir).await?;
        let gz = self.nvd.work_dir.join(format!("nvdcve-2.0-{}.json.gz", key));
        let json = self.nvd.work_dir.join(format!("nvdcve-2.0-{}.json", key));

        let response = self
            .client
            .fetch(&self.nvd.bundle_url(&key), FetchMode::Streaming(gz.clone()))
            .await?;
        debug!(partition = %partition, body = ?response.body, "Downloaded bundle");

        archive::gunzip(&gz, &json).await?;

        let rows = {
            let json = json.clone();
            let expected = meta.sha256.clone();
            tokio::task::spawn_blocking(move || {
                verify_file_sha256(&json, &expected)?;
                let file = std::fs::File::open(&json)?;
                parse_nvd_reader(BufReader::new(file))
            })
            .await
            .map_err(|e| Error::Internal(format!("parse task failed: {}", e)))??
        };

        let counts = (rows.cves.len(), rows.cvss.len());
        self.store.upsert_nvd(rows).await?;
        self.store
            .put_sync_state(&SyncState::new(partition, meta.last_modified, meta.sha256.clone()))?;

        archive::remove_files(&[gz.as_path(), json.as_path()]).await;
        info!(partition = %partition, cves = counts.0, cvss = counts.1, "Partition committed");
        Ok(counts)
    }

    // === OSV ===

    async fn sync_osv_full(&self) -> Result<OsvSyncStats> {
        let work_dir = self.osv.work_dir.clone();
        let result = self.osv_full_in(&work_dir).await;
        archive::remove_dir(&work_dir).await;
        result
    }

    async fn osv_full_in(&self, work_dir: &Path) -> Result<OsvSyncStats> {
        tokio::fs::create_dir_all(work_dir).await?;
        let archive_path = work_dir.join(&self.osv.archive_name);
        self.client
            .fetch(&self.osv.archive_url(), FetchMode::Streaming(archive_path.clone()))
            .await?;

        let checksum = {
            let path = archive_path.clone();
            tokio::task::spawn_blocking(move || sha256_file(path))
                .await
                .map_err(|e| Error::Internal(format!("checksum task failed: {}", e)))??
        };

        let extracted = work_dir.join("extracted");
        archive::unzip(&archive_path, &extracted).await?;
        let files = archive::json_files(&extracted);

        let mut stats = OsvSyncStats {
            total_entries: files.len(),
            updates_needed: files.len(),
            ..Default::default()
        };
        info!(files = files.len(), "Ingesting OSV archive");

        let batch_size = self.osv.batch_records.max(1);
        let mut batch = OsvRows::default();
        for file in &files {
            self.cancel.check("osv full sync")?;
            match read_osv_file(file).await {
                Ok(rows) => {
                    batch.append(rows);
                    stats.updates_successful += 1;
                }
                Err(e) => {
                    warn!(file = %file.display(), code = e.code(), "Skipping OSV file: {}", e);
                    stats.updates_failed += 1;
                }
            }
            if batch.records.len() >= batch_size {
                stats.records += self.commit_osv(std::mem::take(&mut batch)).await?;
            }
        }
        stats.records += self.commit_osv(batch).await?;

        self.store
            .put_sync_state(&SyncState::new(Partition::OsvCursor, Utc::now(), checksum))?;

        info!(
            total_entries = stats.total_entries,
            records = stats.records,
            failed = stats.updates_failed,
            "OSV full sync finished"
        );
        Ok(stats)
    }

    async fn commit_osv(&self, rows: OsvRows) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let records = rows.records.len();
        self.store.upsert_osv(rows).await?;
        debug!(records, "Committed OSV batch");
        Ok(records)
    }

    async fn sync_osv_recent(&self) -> Result<OsvSyncStats> {
        let work_dir = self.osv.work_dir.clone();
        let result = self.osv_recent_in(&work_dir).await;
        archive::remove_dir(&work_dir).await;
        result
    }

    async fn osv_recent_in(&self, work_dir: &Path) -> Result<OsvSyncStats> {
        tokio::fs::create_dir_all(work_dir).await?;
        let index_path = work_dir.join(&self.osv.index_name);
        self.client
            .fetch(&self.osv.index_url(), FetchMode::Streaming(index_path.clone()))
            .await?;

        let text = tokio::fs::read_to_string(&index_path).await?;
        let checksum = sha256_hex(text.as_bytes());
        let entries = parse_change_index(&text)?;
        let newest = entries.iter().map(|entry| entry.modified).max();

        let mut stats = OsvSyncStats {
            total_entries: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            self.cancel.check("osv recent sync")?;

            match self.osv_entry_is_stale(entry) {
                Ok(false) => continue,
                Ok(true) => stats.updates_needed += 1,
                Err(e) => {
                    warn!(id = %entry.id, "Failed to read stored OSV record: {}", e);
                    stats.updates_needed += 1;
                    stats.updates_failed += 1;
                    continue;
                }
            }

            match self.ingest_osv_object(entry).await {
                Ok(records) => {
                    stats.updates_successful += 1;
                    stats.records += records;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(id = %entry.id, code = e.code(), "Failed to ingest OSV object: {}", e);
                    stats.updates_failed += 1;
                }
            }
        }

        if let Some(newest) = newest {
            self.store
                .put_sync_state(&SyncState::new(Partition::OsvCursor, newest, checksum))?;
        }

        info!(
            total_entries = stats.total_entries,
            updates_needed = stats.updates_needed,
            updates_successful = stats.updates_successful,
            updates_failed = stats.updates_failed,
            "OSV recent sync finished"
        );
        Ok(stats)
    }

    /// Unseen records and records with an unreadable stored timestamp are stale
    fn osv_entry_is_stale(&self, entry: &ChangeEntry) -> Result<bool> {
        let stored = self.store.osv_modified(entry.record_id())?;
        Ok(match stored.as_deref().and_then(parse_instant) {
            Some(stored) => entry.modified > stored,
            None => true,
        })
    }

    async fn ingest_osv_object(&self, entry: &ChangeEntry) -> Result<usize> {
        let text = self.client.fetch_text(&self.osv.object_url(&entry.id)).await?;
        let rows = parse_osv(&text)?;
        if rows.records.is_empty() {
            return Err(Error::InvalidRecord {
                record_id: entry.id.clone(),
                message: String::from("object lacks id or modified"),
            });
        }
        self.commit_osv(rows).await
    }
}

async fn read_osv_file(path: &Path) -> Result<OsvRows> {
    let text = tokio::fs::read_to_string(path).await?;
    let rows = parse_osv(&text)?;
    if rows.records.is_empty() {
        return Err(Error::InvalidRecord {
            record_id: path.display().to_string(),
            message: String::from("object lacks id or modified"),
        });
    }
    Ok(rows)
}
