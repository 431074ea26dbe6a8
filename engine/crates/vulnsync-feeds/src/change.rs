//! Decides whether a partition must be fetched again

use chrono::{DateTime, Duration, Utc};
use vulnsync_core::{Partition, Result};
use vulnsync_store::SyncStateStore;

/// Compares remote freshness markers against stored sync state
pub struct ChangeDetector<'a, S: SyncStateStore + ?Sized> {
    store: &'a S,
    full_rescan_after: Duration,
}

impl<'a, S: SyncStateStore + ?Sized> ChangeDetector<'a, S> {
    pub fn new(store: &'a S, full_rescan_after_days: u32) -> Self {
        Self {
            store,
            full_rescan_after: Duration::days(i64::from(full_rescan_after_days)),
        }
    }

    /// Whether `partition` changed since its last committed ingestion
    ///
    /// A matching checksum means unchanged regardless of timestamps.
    pub fn needs_update(
        &self,
        partition: Partition,
        remote_modified: DateTime<Utc>,
        remote_checksum: &str,
    ) -> Result<bool> {
        let Some(stored) = self.store.sync_state(partition)? else {
            return Ok(true);
        };
        if stored.checksum.eq_ignore_ascii_case(remote_checksum) {
            return Ok(false);
        }
        Ok(remote_modified > stored.last_modified)
    }

    /// Whether the gap since the last "recent" sync is too wide for the delta
    ///
    /// Exactly the threshold is still covered by the delta.
    pub fn needs_full_rescan(
        &self,
        last_overall_sync: Option<DateTime<Utc>>,
        remote_modified: DateTime<Utc>,
    ) -> bool {
        match last_overall_sync {
            None => true,
            Some(last) => remote_modified - last > self.full_rescan_after,
        }
    }

    /// Stored timestamp of the "recent" partition
    pub fn last_overall_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .sync_state(Partition::Recent)?
            .map(|state| state.last_modified))
    }
}
