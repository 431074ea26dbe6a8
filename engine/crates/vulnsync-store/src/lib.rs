//! vulnsync Store - SQLite persistence for feeds and image bindings
//!
//! This crate provides:
//! - `Database`: a serialized writer connection plus a read-only pool
//! - `BulkUpserter`: paged, all-or-nothing multi-row upserts
//! - `SyncStateStore`: monotonic per-partition freshness markers
//! - Exposure and CVSS queries used by version comparison

mod codec;
pub mod connection;
pub mod queries;
pub mod schema;
pub mod sync_state;
pub mod upsert;

pub use connection::Database;
pub use queries::ImageRef;
pub use sync_state::SyncStateStore;
pub use upsert::{BulkUpserter, TableKind, UpsertReport, UpsertRow, MAX_BIND_PARAMS};

use std::sync::Arc;
use vulnsync_common::DatabaseConfig;
use vulnsync_core::{
    CancellationToken, CveRecord, CvssMetric, ImageVulnerability, NvdRows, OsvRows, Result,
};

/// Handle to the vulnsync database
///
/// Cheap to clone; clones share the connections.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    upserter: BulkUpserter,
}

impl Store {
    /// Open or create the database described by `config`
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let db = Arc::new(Database::open(config)?);
        Ok(Self::from_database(db, config))
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = Arc::new(Database::in_memory()?);
        Ok(Self::from_database(db, &DatabaseConfig::default()))
    }

    pub fn from_database(db: Arc<Database>, config: &DatabaseConfig) -> Self {
        let upserter = BulkUpserter::new(db.clone(), config);
        Self { db, upserter }
    }

    /// Share `cancel` with every bulk upsert issued through this handle
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.upserter = self.upserter.with_cancellation(cancel);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.upserter = self.upserter.with_page_size(page_size);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn upsert_cves(&self, rows: Vec<CveRecord>) -> Result<UpsertReport> {
        self.upserter.upsert(rows).await
    }

    pub async fn upsert_cvss(&self, rows: Vec<CvssMetric>) -> Result<UpsertReport> {
        self.upserter.upsert(rows).await
    }

    /// Upsert one NVD bundle: CVEs first, then their CVSS metrics
    pub async fn upsert_nvd(&self, rows: NvdRows) -> Result<Vec<UpsertReport>> {
        let cves = self.upsert_cves(rows.cves).await?;
        let cvss = self.upsert_cvss(rows.cvss).await?;
        Ok(vec![cves, cvss])
    }

    /// Upsert OSV rows table by table, parent records first
    pub async fn upsert_osv(&self, rows: OsvRows) -> Result<Vec<UpsertReport>> {
        Ok(vec![
            self.upserter.upsert(rows.records).await?,
            self.upserter.upsert(rows.aliases).await?,
            self.upserter.upsert(rows.references).await?,
            self.upserter.upsert(rows.severities).await?,
            self.upserter.upsert(rows.affected).await?,
            self.upserter.upsert(rows.credits).await?,
        ])
    }

    pub async fn upsert_image_vulnerabilities(
        &self,
        rows: Vec<ImageVulnerability>,
    ) -> Result<UpsertReport> {
        self.upserter.upsert(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vulnsync_core::{OsvAlias, OsvRecord};

    #[tokio::test]
    async fn test_upsert_nvd_then_read_back() {
        let store = Store::in_memory().unwrap();
        let rows = NvdRows {
            cves: vec![CveRecord {
                id: "CVE-2024-1234".into(),
                source_identifier: Some("cna@example.com".into()),
                published: Some("2024-01-02T03:04:05.000".into()),
                last_modified: Some("2024-01-03T03:04:05.000".into()),
                vuln_status: Some("Analyzed".into()),
                references: "https://a.example\nhttps://b.example".into(),
                descriptions: json!([{"lang": "en", "value": "overflow"}]),
                weaknesses: json!([]),
                configurations: json!(null),
            }],
            cvss: vec![CvssMetric {
                cve_id: "CVE-2024-1234".into(),
                source: "nvd@nist.gov".into(),
                cvss_version: "3.1".into(),
                vector_string: Some("CVSS:3.1/AV:N/AC:L".into()),
                base_score: Some(9.8),
                base_severity: Some("CRITICAL".into()),
            }],
        };

        let reports = store.upsert_nvd(rows.clone()).await.unwrap();
        assert_eq!(reports[0].table, TableKind::Cve);
        assert_eq!(reports[1].table, TableKind::Cvss);

        let cve = store.cve("CVE-2024-1234").unwrap().unwrap();
        assert_eq!(cve, rows.cves[0]);
        assert_eq!(store.cvss_metrics("CVE-2024-1234").unwrap(), rows.cvss);
    }

    #[tokio::test]
    async fn test_upsert_osv_tables() {
        let store = Store::in_memory().unwrap();
        let rows = OsvRows {
            records: vec![OsvRecord {
                id: "GHSA-xxxx".into(),
                schema_version: Some("1.6.0".into()),
                modified: "2024-04-01T00:00:00Z".into(),
                published: None,
                withdrawn: None,
                summary: Some("bad".into()),
                details: None,
                database_specific: None,
            }],
            aliases: vec![
                OsvAlias {
                    osv_id: "GHSA-xxxx".into(),
                    alias: "CVE-2024-1".into(),
                },
                OsvAlias {
                    osv_id: "GHSA-xxxx".into(),
                    alias: "CVE-2024-1".into(),
                },
            ],
            ..Default::default()
        };

        let reports = store.upsert_osv(rows).await.unwrap();
        assert_eq!(reports.len(), 6);
        assert_eq!(store.row_count(TableKind::OsvAlias).unwrap(), 1);
        assert_eq!(
            store.osv_modified("GHSA-xxxx").unwrap().as_deref(),
            Some("2024-04-01T00:00:00Z")
        );
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("vulnsync.db"),
            ..Default::default()
        };
        let store = Store::open(&config).unwrap();
        assert_eq!(store.database().path(), Some(config.path.as_path()));

        // Reopening applies the schema idempotently.
        drop(store);
        assert!(Store::open(&config).is_ok());
    }
}
