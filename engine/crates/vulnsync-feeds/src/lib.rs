//! vulnsync Feeds - NVD and OSV feed synchronization
//!
//! This crate provides:
//! - A rate-limited, retrying HTTP client for feed artifacts
//! - NVD JSON 2.0 bundle and `.meta` parsing
//! - OSV advisory normalization and change index parsing
//! - Partition change detection against stored sync state
//! - `SyncOrchestrator`, which drives a full or recent sync of one feed

pub mod archive;
pub mod change;
pub mod client;
pub mod index;
pub mod limiter;
pub mod meta;
pub mod nvd;
pub mod osv;
pub mod sync;

pub use change::ChangeDetector;
pub use client::{FeedClient, FetchBody, FetchMode, FetchResponse, RetryPolicy};
pub use index::{parse_change_index, ChangeEntry};
pub use limiter::{FetchLimiter, WaitClock};
pub use meta::NvdMeta;
pub use nvd::{parse_nvd_feed, parse_nvd_reader};
pub use osv::{parse_osv, parse_osv_value};
pub use sync::{Feed, NvdSyncStats, OsvSyncStats, SyncMode, SyncOrchestrator, SyncReport};
