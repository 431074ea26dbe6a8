//! vulnsync Core - Record types, partitions and error handling
//!
//! This crate provides the shared vocabulary of the vulnsync workspace:
//! - `CveRecord`, `CvssMetric`, `OsvRecord` and its child rows: normalized feed rows
//! - `ImageVulnerability`: a CVE observed in one version of a scanned image
//! - `Partition` / `SyncState`: per-partition feed freshness markers
//! - `Error`: the discriminated error type returned by every operation

pub mod binding;
pub mod cancellation;
pub mod error;
pub mod partition;
pub mod records;
pub mod severity;

// Re-export commonly used types at crate root
pub use binding::{ImageVulnTuple, ImageVulnerability};
pub use cancellation::CancellationToken;
pub use error::{Error, Result};
pub use partition::{Partition, SyncState};
pub use records::{
    CveRecord, CvssMetric, NvdRows, OsvAffected, OsvAlias, OsvCredit, OsvRecord, OsvReference,
    OsvRows, OsvSeverity,
};
pub use severity::Severity;
