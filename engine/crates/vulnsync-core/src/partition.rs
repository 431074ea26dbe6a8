//! Feed partitions and their stored sync state

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A unit of feed freshness tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Yearly NVD bundle
    Year(u16),
    /// Rolling NVD delta of recently changed CVEs
    Recent,
    /// OSV sync cursor
    OsvCursor,
}

impl Partition {
    pub const RECENT_KEY: &'static str = "recent";
    pub const OSV_KEY: &'static str = "osv";

    /// Storage key of this partition
    pub fn key(&self) -> String {
        match self {
            Partition::Year(year) => year.to_string(),
            Partition::Recent => String::from(Self::RECENT_KEY),
            Partition::OsvCursor => String::from(Self::OSV_KEY),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Partition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            Self::RECENT_KEY => Ok(Partition::Recent),
            Self::OSV_KEY => Ok(Partition::OsvCursor),
            other => other
                .parse::<u16>()
                .map(Partition::Year)
                .map_err(|_| Error::Parse(format!("Unknown partition key: {}", other))),
        }
    }
}

/// Stored freshness marker for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub partition: Partition,
    /// Remote modification time of the last fully committed ingestion
    pub last_modified: DateTime<Utc>,
    /// Lowercase hex checksum of that ingestion's artifact
    pub checksum: String,
}

impl SyncState {
    pub fn new(
        partition: Partition,
        last_modified: DateTime<Utc>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            last_modified,
            checksum: checksum.into().to_ascii_lowercase(),
        }
    }
}
