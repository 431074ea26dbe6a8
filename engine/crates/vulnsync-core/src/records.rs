//! Normalized feed rows, one struct per stored table

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A CVE from the NVD feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    pub id: String,
    pub source_identifier: Option<String>,
    pub published: Option<String>,
    pub last_modified: Option<String>,
    pub vuln_status: Option<String>,
    /// Reference URLs joined by newlines
    pub references: String,
    pub descriptions: Value,
    pub weaknesses: Value,
    pub configurations: Value,
}

/// One CVSS score attached to a CVE by a scoring source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvssMetric {
    pub cve_id: String,
    pub source: String,
    pub cvss_version: String,
    pub vector_string: Option<String>,
    pub base_score: Option<f64>,
    pub base_severity: Option<String>,
}

/// Rows produced from one NVD bundle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvdRows {
    pub cves: Vec<CveRecord>,
    pub cvss: Vec<CvssMetric>,
}

/// Top-level OSV advisory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvRecord {
    pub id: String,
    pub schema_version: Option<String>,
    pub modified: String,
    pub published: Option<String>,
    pub withdrawn: Option<String>,
    pub summary: Option<String>,
    pub details: Option<String>,
    pub database_specific: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvAlias {
    pub osv_id: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvReference {
    pub osv_id: String,
    pub ref_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvSeverity {
    pub osv_id: String,
    pub severity_type: String,
    pub score: String,
}

/// A package affected by an OSV advisory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvAffected {
    pub osv_id: String,
    pub ecosystem: String,
    pub name: String,
    pub purl: Option<String>,
    pub ranges: Option<Value>,
    pub versions: Option<Value>,
    pub ecosystem_specific: Option<Value>,
    pub database_specific: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvCredit {
    pub osv_id: String,
    pub name: String,
    pub contact: Option<Value>,
    pub credit_type: Option<String>,
}

/// Rows produced from one or more OSV objects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OsvRows {
    pub records: Vec<OsvRecord>,
    pub aliases: Vec<OsvAlias>,
    pub references: Vec<OsvReference>,
    pub severities: Vec<OsvSeverity>,
    pub affected: Vec<OsvAffected>,
    pub credits: Vec<OsvCredit>,
}

impl OsvRows {
    /// True when all six collections are empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.aliases.is_empty()
            && self.references.is_empty()
            && self.severities.is_empty()
            && self.affected.is_empty()
            && self.credits.is_empty()
    }

    /// Move all rows of `other` into `self`
    pub fn append(&mut self, mut other: OsvRows) {
        self.records.append(&mut other.records);
        self.aliases.append(&mut other.aliases);
        self.references.append(&mut other.references);
        self.severities.append(&mut other.severities);
        self.affected.append(&mut other.affected);
        self.credits.append(&mut other.credits);
    }
}
