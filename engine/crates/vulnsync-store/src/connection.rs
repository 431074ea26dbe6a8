//! SQLite connections: one serialized writer plus a pool of readers

use crate::schema;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};
use vulnsync_common::DatabaseConfig;
use vulnsync_core::{Error, Result};

const MAX_READERS: usize = 8;

/// Pause between attempts to take a busy writer
const WRITER_POLL: Duration = Duration::from_millis(5);

/// Map a rusqlite error, keeping lock contention distinguishable
pub(crate) fn sqlite_error(context: &str, err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            Error::DatabaseBusy(format!("{}: {}", context, err))
        }
        _ => Error::Persistence(format!("{}: {}", context, err)),
    }
}

/// Whether a rusqlite error came from `sqlite3_interrupt`
pub(crate) fn is_interrupt(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
}

/// Round-robin pool of read-only connections
struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl ReadPool {
    fn open(path: &Path, size: usize, busy_timeout: Duration) -> Result<Self> {
        let size = size.clamp(1, MAX_READERS);
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| sqlite_error("open reader", e))?;
            conn.busy_timeout(busy_timeout)
                .map_err(|e| sqlite_error("reader busy timeout", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let guard = self.connections[idx]
            .lock()
            .map_err(|_| Error::Persistence("read pool lock poisoned".to_string()))?;
        f(&guard)
    }
}

/// The vulnsync database
///
/// Writes go through a single connection guarded by a mutex, so only one
/// bulk upsert transaction runs at a time within the process. File-backed
/// databases also get a pool of read-only connections; in-memory databases
/// serve reads from the writer.
pub struct Database {
    writer: Mutex<Connection>,
    interrupt: InterruptHandle,
    readers: Option<ReadPool>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file and apply the schema
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = config.path.as_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path).map_err(|e| sqlite_error("open database", e))?;
        writer
            .busy_timeout(config.busy_timeout())
            .map_err(|e| sqlite_error("busy timeout", e))?;
        writer
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| sqlite_error("enable WAL", e))?;
        writer
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| sqlite_error("synchronous pragma", e))?;
        schema::apply(&writer)?;

        let readers = ReadPool::open(path, config.read_pool_size, config.busy_timeout())?;
        let interrupt = writer.get_interrupt_handle();

        tracing::debug!(path = %path.display(), readers = config.read_pool_size, "Opened database");

        Ok(Self {
            writer: Mutex::new(writer),
            interrupt,
            readers: Some(readers),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let writer =
            Connection::open_in_memory().map_err(|e| sqlite_error("open in-memory database", e))?;
        schema::apply(&writer)?;
        let interrupt = writer.get_interrupt_handle();

        Ok(Self {
            writer: Mutex::new(writer),
            interrupt,
            readers: None,
            path: None,
        })
    }

    /// Run `f` on the writer connection
    pub fn with_writer<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| Error::Persistence("write lock poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Run `f` on the writer connection, waiting for it no later than `deadline`
    ///
    /// Returns [`Error::Timeout`] without running `f` when another caller
    /// keeps the writer past the deadline.
    pub fn with_writer_until<F, T>(&self, deadline: Instant, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let started = Instant::now();
        loop {
            match self.writer.try_lock() {
                Ok(mut guard) => return f(&mut guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(Error::Persistence("write lock poisoned".to_string()))
                }
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout {
                            operation: String::from("waiting for the database writer"),
                            seconds: now.duration_since(started).as_secs(),
                        });
                    }
                    std::thread::sleep(WRITER_POLL.min(deadline - now));
                }
            }
        }
    }

    /// Run `f` on a read connection
    pub fn with_reader<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match &self.readers {
            Some(pool) => pool.with_conn(f),
            None => self.with_writer(|conn| f(conn)),
        }
    }

    /// Abort whatever statement the writer is running
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Database file path (None for in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_serves_reads_from_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("vulnsync.db"),
            read_pool_size: 2,
            ..Default::default()
        };
        let db = Database::open(&config).unwrap();
        assert!(db.path().is_some());

        db.with_writer(|conn| {
            conn.execute(
                "INSERT INTO sync_state (partition, last_modified, checksum, updated_at) VALUES ('recent', 'a', 'b', 'c')",
                [],
            )
            .map_err(|e| sqlite_error("insert", e))
        })
        .unwrap();

        let count: i64 = db
            .with_reader(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sync_state", [], |row| row.get(0))
                    .map_err(|e| sqlite_error("count", e))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_readers_are_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("vulnsync.db"),
            ..Default::default()
        };
        let db = Database::open(&config).unwrap();

        let result = db.with_reader(|conn| {
            conn.execute("DELETE FROM sync_state", [])
                .map_err(|e| sqlite_error("delete", e))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_writer_wait_gives_up_at_deadline() {
        let db = std::sync::Arc::new(Database::in_memory().unwrap());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();

        let holder = {
            let db = db.clone();
            std::thread::spawn(move || {
                db.with_writer(|_| {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(400));
                    Ok(())
                })
            })
        };
        locked_rx.recv().unwrap();

        let started = Instant::now();
        let err = db
            .with_writer_until(started + Duration::from_millis(50), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert!(started.elapsed() < Duration::from_millis(300));

        holder.join().unwrap().unwrap();
        assert!(db
            .with_writer_until(Instant::now() + Duration::from_millis(50), |_| Ok(()))
            .is_ok());
    }

    #[test]
    fn test_in_memory_reads_from_writer() {
        let db = Database::in_memory().unwrap();
        assert!(db.path().is_none());

        let tables: i64 = db
            .with_reader(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'cves'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("tables", e))
            })
            .unwrap();
        assert_eq!(tables, 1);
    }
}
