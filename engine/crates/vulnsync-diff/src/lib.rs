//! vulnsync Diff - Vulnerability exposure comparison between image versions
//!
//! Classifies every `(cve, component type, component)` key recorded for two
//! versions of an image as shared, only in version A or only in version B,
//! and attaches the best known CVSS metric of each CVE.

pub mod compare;

pub use compare::{
    Classification, ComparisonEngine, ComparisonResult, ComparisonRow, ComparisonStats,
    SeverityCounts, VulnSetSource,
};
