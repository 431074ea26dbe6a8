//! Read queries used by sync and comparison

use crate::codec;
use crate::connection::sqlite_error;
use crate::upsert::TableKind;
use crate::Store;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::HashMap;
use vulnsync_core::{CveRecord, CvssMetric, ImageVulnTuple, ImageVulnerability, Result};

/// Identifies one scanned image version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub team: String,
    pub product: String,
    pub image_name: String,
    pub image_version: String,
}

impl ImageRef {
    pub fn new(
        team: impl Into<String>,
        product: impl Into<String>,
        image_name: impl Into<String>,
        image_version: impl Into<String>,
    ) -> Self {
        Self {
            team: team.into(),
            product: product.into(),
            image_name: image_name.into(),
            image_version: image_version.into(),
        }
    }
}

// Keeps IN (...) lists well below the bind-parameter limit.
const CVE_CHUNK: usize = 500;

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn cvss_from_row(row: &Row<'_>) -> rusqlite::Result<CvssMetric> {
    Ok(CvssMetric {
        cve_id: row.get(0)?,
        source: row.get(1)?,
        cvss_version: row.get(2)?,
        vector_string: row.get(3)?,
        base_score: row.get(4)?,
        base_severity: row.get(5)?,
    })
}

impl Store {
    /// Distinct exposure tuples recorded for one image version
    pub fn image_vuln_set(&self, image: &ImageRef) -> Result<Vec<ImageVulnTuple>> {
        self.database().with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT DISTINCT cve_id, component_type, component, affected_path
                     FROM image_vulnerabilities
                     WHERE team = ?1 AND product = ?2 AND image_name = ?3 AND image_version = ?4
                     ORDER BY cve_id, component, component_type, affected_path",
                )
                .map_err(|e| sqlite_error("prepare image set", e))?;
            let rows = stmt
                .query_map(
                    params![image.team, image.product, image.image_name, image.image_version],
                    |row| {
                        Ok(ImageVulnTuple {
                            cve_id: row.get(0)?,
                            component_type: row.get(1)?,
                            component: row.get(2)?,
                            path: row.get(3)?,
                        })
                    },
                )
                .map_err(|e| sqlite_error("query image set", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| sqlite_error("read image set", e))
        })
    }

    /// Full binding rows for one image version
    pub fn image_vulnerabilities(&self, image: &ImageRef) -> Result<Vec<ImageVulnerability>> {
        self.database().with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT scanner, image_name, image_version, product, team, cve_id,
                            component_type, component, fix_versions, first_seen, last_seen,
                            affected_version, affected_path
                     FROM image_vulnerabilities
                     WHERE team = ?1 AND product = ?2 AND image_name = ?3 AND image_version = ?4
                     ORDER BY cve_id, component_type, component, scanner",
                )
                .map_err(|e| sqlite_error("prepare bindings", e))?;
            let rows = stmt
                .query_map(
                    params![image.team, image.product, image.image_name, image.image_version],
                    |row| {
                        Ok(ImageVulnerability {
                            scanner: row.get(0)?,
                            image_name: row.get(1)?,
                            image_version: row.get(2)?,
                            product: row.get(3)?,
                            team: row.get(4)?,
                            cve_id: row.get(5)?,
                            component_type: row.get(6)?,
                            component: row.get(7)?,
                            fix_versions: row.get(8)?,
                            first_seen: ts_column(row, 9)?,
                            last_seen: ts_column(row, 10)?,
                            affected_version: row.get(11)?,
                            affected_path: row.get(12)?,
                        })
                    },
                )
                .map_err(|e| sqlite_error("query bindings", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| sqlite_error("read bindings", e))
        })
    }

    /// Best CVSS metric per CVE
    ///
    /// Highest score wins; unscored metrics rank last. Ties go to the
    /// alphabetically first source, then the newest CVSS version.
    pub fn best_cvss(&self, cve_ids: &[String]) -> Result<HashMap<String, CvssMetric>> {
        let mut best = HashMap::with_capacity(cve_ids.len());
        for chunk in cve_ids.chunks(CVE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT cve_id, source, cvss_version, vector_string, base_score, base_severity
                 FROM (
                     SELECT *, ROW_NUMBER() OVER (
                         PARTITION BY cve_id
                         ORDER BY base_score IS NULL, base_score DESC, source ASC, cvss_version DESC
                     ) AS rn
                     FROM cvss_metrics
                     WHERE cve_id IN ({})
                 )
                 WHERE rn = 1",
                placeholders
            );
            let metrics: Vec<CvssMetric> = self.database().with_reader(|conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| sqlite_error("prepare best cvss", e))?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), cvss_from_row)
                    .map_err(|e| sqlite_error("query best cvss", e))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| sqlite_error("read best cvss", e))
            })?;
            for metric in metrics {
                best.insert(metric.cve_id.clone(), metric);
            }
        }
        Ok(best)
    }

    /// All CVSS metrics stored for one CVE
    pub fn cvss_metrics(&self, cve_id: &str) -> Result<Vec<CvssMetric>> {
        self.database().with_reader(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT cve_id, source, cvss_version, vector_string, base_score, base_severity
                     FROM cvss_metrics WHERE cve_id = ?1
                     ORDER BY source, cvss_version",
                )
                .map_err(|e| sqlite_error("prepare cvss", e))?;
            let rows = stmt
                .query_map([cve_id], cvss_from_row)
                .map_err(|e| sqlite_error("query cvss", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| sqlite_error("read cvss", e))
        })
    }

    pub fn cve(&self, cve_id: &str) -> Result<Option<CveRecord>> {
        self.database().with_reader(|conn| {
            conn.query_row(
                "SELECT id, source_identifier, published, last_modified, vuln_status, refs,
                        descriptions, weaknesses, configurations
                 FROM cves WHERE id = ?1",
                [cve_id],
                |row| {
                    Ok(CveRecord {
                        id: row.get(0)?,
                        source_identifier: row.get(1)?,
                        published: row.get(2)?,
                        last_modified: row.get(3)?,
                        vuln_status: row.get(4)?,
                        references: row.get(5)?,
                        descriptions: codec::parse_json(row.get(6)?),
                        weaknesses: codec::parse_json(row.get(7)?),
                        configurations: codec::parse_json(row.get(8)?),
                    })
                },
            )
            .optional()
            .map_err(|e| sqlite_error("read cve", e))
        })
    }

    /// Stored `modified` timestamp of an OSV record
    pub fn osv_modified(&self, osv_id: &str) -> Result<Option<String>> {
        self.database().with_reader(|conn| {
            conn.query_row(
                "SELECT modified FROM osv_records WHERE id = ?1",
                [osv_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| sqlite_error("read osv modified", e))
        })
    }

    pub fn row_count(&self, table: TableKind) -> Result<u64> {
        self.database().with_reader(|conn| {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {}", table.table_name()),
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| sqlite_error("count rows", e))?;
            Ok(count as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric(cve: &str, source: &str, version: &str, score: Option<f64>) -> CvssMetric {
        CvssMetric {
            cve_id: cve.into(),
            source: source.into(),
            cvss_version: version.into(),
            vector_string: None,
            base_score: score,
            base_severity: None,
        }
    }

    fn binding(
        version: &str,
        cve: &str,
        component: &str,
        path: Option<&str>,
    ) -> ImageVulnerability {
        let seen = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        ImageVulnerability {
            scanner: "trivy".into(),
            image_name: "registry/app".into(),
            image_version: version.into(),
            product: "shop".into(),
            team: "payments".into(),
            cve_id: cve.into(),
            component_type: "library".into(),
            component: component.into(),
            fix_versions: None,
            first_seen: seen,
            last_seen: seen,
            affected_version: None,
            affected_path: path.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_best_cvss_ranking() {
        let store = Store::in_memory().unwrap();
        store
            .upsert_cvss(vec![
                metric("CVE-1", "nvd@nist.gov", "3.1", Some(7.5)),
                metric("CVE-1", "vendor", "3.1", Some(9.8)),
                metric("CVE-1", "other", "2.0", None),
                // Tied scores: source ascending, then newest version.
                metric("CVE-2", "b-source", "3.1", Some(5.0)),
                metric("CVE-2", "a-source", "3.0", Some(5.0)),
                metric("CVE-2", "a-source", "3.1", Some(5.0)),
                metric("CVE-3", "nvd@nist.gov", "2.0", None),
            ])
            .await
            .unwrap();

        let ids: Vec<String> = ["CVE-1", "CVE-2", "CVE-3", "CVE-404"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let best = store.best_cvss(&ids).unwrap();

        assert_eq!(best.len(), 3);
        assert_eq!(best["CVE-1"].source, "vendor");
        assert_eq!(best["CVE-2"].source, "a-source");
        assert_eq!(best["CVE-2"].cvss_version, "3.1");
        assert_eq!(best["CVE-3"].base_score, None);
        assert!(!best.contains_key("CVE-404"));
    }

    #[tokio::test]
    async fn test_image_vuln_set_is_distinct_and_scoped() {
        let store = Store::in_memory().unwrap();
        let mut grype = binding("1.0", "CVE-1", "openssl", Some("/usr/lib"));
        grype.scanner = "grype".into();
        store
            .upsert_image_vulnerabilities(vec![
                binding("1.0", "CVE-1", "openssl", Some("/usr/lib")),
                grype,
                binding("1.0", "CVE-2", "zlib", None),
                binding("2.0", "CVE-3", "curl", None),
            ])
            .await
            .unwrap();

        let set = store
            .image_vuln_set(&ImageRef::new("payments", "shop", "registry/app", "1.0"))
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].cve_id, "CVE-1");
        assert_eq!(set[0].path.as_deref(), Some("/usr/lib"));
        assert_eq!(set[1].cve_id, "CVE-2");

        let bindings = store
            .image_vulnerabilities(&ImageRef::new("payments", "shop", "registry/app", "1.0"))
            .unwrap();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].first_seen, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_row_count_and_missing_lookups() {
        let store = Store::in_memory().unwrap();
        for table in TableKind::ALL {
            assert_eq!(store.row_count(table).unwrap(), 0);
        }
        assert!(store.cve("CVE-404").unwrap().is_none());
        assert!(store.osv_modified("GHSA-404").unwrap().is_none());
    }
}
