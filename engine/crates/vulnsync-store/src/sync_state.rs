//! Per-partition sync state

use crate::codec;
use crate::connection::sqlite_error;
use crate::Store;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use vulnsync_core::{Partition, Result, SyncState};

/// Read and write access to stored partition freshness
pub trait SyncStateStore: Send + Sync {
    /// All partitions with stored state, in key order
    fn sync_partitions(&self) -> Result<Vec<Partition>>;

    fn sync_state(&self, partition: Partition) -> Result<Option<SyncState>>;

    /// Store `state` unless it would move the partition backwards in time
    ///
    /// Returns whether the stored state changed.
    fn put_sync_state(&self, state: &SyncState) -> Result<bool>;
}

impl SyncStateStore for Store {
    fn sync_partitions(&self) -> Result<Vec<Partition>> {
        let keys: Vec<String> = self.database().with_reader(|conn| {
            let mut stmt = conn
                .prepare("SELECT partition FROM sync_state ORDER BY partition")
                .map_err(|e| sqlite_error("list partitions", e))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| sqlite_error("list partitions", e))?;
            rows.collect::<std::result::Result<Vec<String>, _>>()
                .map_err(|e| sqlite_error("list partitions", e))
        })?;

        let mut partitions = Vec::with_capacity(keys.len());
        for key in keys {
            match key.parse::<Partition>() {
                Ok(partition) => partitions.push(partition),
                Err(_) => tracing::warn!(key = %key, "Ignoring unknown sync partition"),
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    fn sync_state(&self, partition: Partition) -> Result<Option<SyncState>> {
        let row: Option<(String, String)> = self.database().with_reader(|conn| {
            conn.query_row(
                "SELECT last_modified, checksum FROM sync_state WHERE partition = ?1",
                [partition.key()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| sqlite_error("read sync state", e))
        })?;

        match row {
            Some((last_modified, checksum)) => Ok(Some(SyncState::new(
                partition,
                codec::parse_ts(&last_modified)?,
                checksum,
            ))),
            None => Ok(None),
        }
    }

    fn put_sync_state(&self, state: &SyncState) -> Result<bool> {
        let changed = self.database().with_writer(|conn| {
            conn.execute(
                "INSERT INTO sync_state (partition, last_modified, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (partition) DO UPDATE SET
                     last_modified = excluded.last_modified,
                     checksum = excluded.checksum,
                     updated_at = excluded.updated_at
                 WHERE excluded.last_modified >= sync_state.last_modified",
                params![
                    state.partition.key(),
                    codec::format_ts(&state.last_modified),
                    state.checksum.to_ascii_lowercase(),
                    codec::format_ts(&Utc::now()),
                ],
            )
            .map_err(|e| sqlite_error("write sync state", e))
        })?;

        if changed == 0 {
            tracing::warn!(
                partition = %state.partition,
                last_modified = %state.last_modified,
                "Refusing to move sync state backwards"
            );
        }
        Ok(changed > 0)
    }
}
