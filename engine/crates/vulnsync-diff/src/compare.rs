//! Exposure comparison - which vulnerabilities two image versions share
//!
//! Both versions' distinct `(cve, component type, component, path)` tuples
//! are outer-joined on `(cve, component type, component)`. Each joined key
//! becomes one row carrying the paths seen on either side and the best
//! known CVSS metric of its CVE.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};
use vulnsync_core::{CvssMetric, ImageVulnTuple, Result, Severity};
use vulnsync_store::{ImageRef, Store};

/// Read access the comparison needs
pub trait VulnSetSource {
    /// Distinct exposure tuples of one image version
    fn vuln_set(&self, image: &ImageRef) -> Result<Vec<ImageVulnTuple>>;

    /// Best CVSS metric per CVE; CVEs without metrics are absent
    fn best_cvss(&self, cve_ids: &[String]) -> Result<HashMap<String, CvssMetric>>;
}

impl VulnSetSource for Store {
    fn vuln_set(&self, image: &ImageRef) -> Result<Vec<ImageVulnTuple>> {
        self.image_vuln_set(image)
    }

    fn best_cvss(&self, cve_ids: &[String]) -> Result<HashMap<String, CvssMetric>> {
        Store::best_cvss(self, cve_ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Shared,
    OnlyVersionA,
    OnlyVersionB,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Shared => "shared",
            Classification::OnlyVersionA => "only_version_a",
            Classification::OnlyVersionB => "only_version_b",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub none: usize,
    pub unknown: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::None => self.none += 1,
            Severity::Unknown => self.unknown += 1,
        }
    }
}

/// Row counts per classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComparisonStats {
    pub shared: usize,
    pub only_version_a: usize,
    pub only_version_b: usize,
    /// Severity breakdown of the rows only version B carries
    pub introduced: SeverityCounts,
    /// Severity breakdown of the rows only version A carries
    pub resolved: SeverityCounts,
}

impl ComparisonStats {
    pub fn total(&self) -> usize {
        self.shared + self.only_version_a + self.only_version_b
    }
}

/// One joined `(cve, component type, component)` key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub cve_id: String,
    pub component_type: String,
    pub component: String,
    pub classification: Classification,
    /// Sorted distinct paths recorded for version A
    pub paths_a: Vec<String>,
    pub paths_b: Vec<String>,
    pub cvss: Option<CvssMetric>,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub team: String,
    pub product: String,
    pub image_name: String,
    pub version_a: String,
    pub version_b: String,
    pub stats: ComparisonStats,
    /// Ordered by CVE id, then component, then component type
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonResult {
    /// Rows with the given classification, in result order
    pub fn rows_of(&self, classification: Classification) -> impl Iterator<Item = &ComparisonRow> {
        self.rows
            .iter()
            .filter(move |row| row.classification == classification)
    }
}

#[derive(Default)]
struct Sides {
    in_a: bool,
    in_b: bool,
    paths_a: BTreeSet<String>,
    paths_b: BTreeSet<String>,
}

/// Compares the exposure of two versions of one image
pub struct ComparisonEngine<S: VulnSetSource> {
    source: S,
}

impl<S: VulnSetSource> ComparisonEngine<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn compare(
        &self,
        team: &str,
        product: &str,
        image_name: &str,
        version_a: &str,
        version_b: &str,
    ) -> Result<ComparisonResult> {
        let set_a = self
            .source
            .vuln_set(&ImageRef::new(team, product, image_name, version_a))?;
        let set_b = self
            .source
            .vuln_set(&ImageRef::new(team, product, image_name, version_b))?;
        debug!(version_a, version_b, a = set_a.len(), b = set_b.len(), "Loaded exposure sets");

        // Key order is the output order: cve, component, component type.
        let mut joined: BTreeMap<(String, String, String), Sides> = BTreeMap::new();
        for (tuples, is_a) in [(set_a, true), (set_b, false)] {
            for tuple in tuples {
                let sides = joined
                    .entry((tuple.cve_id, tuple.component, tuple.component_type))
                    .or_default();
                let paths = if is_a {
                    sides.in_a = true;
                    &mut sides.paths_a
                } else {
                    sides.in_b = true;
                    &mut sides.paths_b
                };
                if let Some(path) = tuple.path.filter(|p| !p.is_empty()) {
                    paths.insert(path);
                }
            }
        }

        let cve_ids: Vec<String> = joined
            .keys()
            .map(|(cve, _, _)| cve.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let best = self.source.best_cvss(&cve_ids)?;

        let mut stats = ComparisonStats::default();
        let mut rows = Vec::with_capacity(joined.len());
        for ((cve_id, component, component_type), sides) in joined {
            let classification = match (sides.in_a, sides.in_b) {
                (true, true) => Classification::Shared,
                (true, false) => Classification::OnlyVersionA,
                _ => Classification::OnlyVersionB,
            };
            let cvss = best.get(&cve_id).cloned();
            let severity = cvss
                .as_ref()
                .map(|m| Severity::resolve(m.base_severity.as_deref(), m.base_score))
                .unwrap_or_default();

            match classification {
                Classification::Shared => stats.shared += 1,
                Classification::OnlyVersionA => {
                    stats.only_version_a += 1;
                    stats.resolved.add(severity);
                }
                Classification::OnlyVersionB => {
                    stats.only_version_b += 1;
                    stats.introduced.add(severity);
                }
            }

            rows.push(ComparisonRow {
                cve_id,
                component_type,
                component,
                classification,
                paths_a: sides.paths_a.into_iter().collect(),
                paths_b: sides.paths_b.into_iter().collect(),
                cvss,
                severity,
            });
        }

        info!(
            image = image_name,
            version_a,
            version_b,
            shared = stats.shared,
            only_a = stats.only_version_a,
            only_b = stats.only_version_b,
            "Compared image versions"
        );

        Ok(ComparisonResult {
            team: team.to_string(),
            product: product.to_string(),
            image_name: image_name.to_string(),
            version_a: version_a.to_string(),
            version_b: version_b.to_string(),
            stats,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vulnsync_core::ImageVulnerability;

    #[derive(Default)]
    struct FakeSource {
        sets: HashMap<String, Vec<ImageVulnTuple>>,
        metrics: HashMap<String, CvssMetric>,
    }

    impl VulnSetSource for FakeSource {
        fn vuln_set(&self, image: &ImageRef) -> Result<Vec<ImageVulnTuple>> {
            Ok(self.sets.get(&image.image_version).cloned().unwrap_or_default())
        }

        fn best_cvss(&self, cve_ids: &[String]) -> Result<HashMap<String, CvssMetric>> {
            Ok(cve_ids
                .iter()
                .filter_map(|id| self.metrics.get(id).map(|m| (id.clone(), m.clone())))
                .collect())
        }
    }

    fn tuple(cve: &str, component: &str, path: Option<&str>) -> ImageVulnTuple {
        ImageVulnTuple {
            cve_id: cve.into(),
            component_type: "library".into(),
            component: component.into(),
            path: path.map(String::from),
        }
    }

    fn metric(cve: &str, score: f64, severity: &str) -> CvssMetric {
        CvssMetric {
            cve_id: cve.into(),
            source: "nvd@nist.gov".into(),
            cvss_version: "3.1".into(),
            vector_string: None,
            base_score: Some(score),
            base_severity: Some(severity.into()),
        }
    }

    #[test]
    fn test_classification_partition() {
        let mut source = FakeSource::default();
        source.sets.insert(
            "1.0".into(),
            vec![tuple("CVE-X", "openssl", None), tuple("CVE-Y", "zlib", None)],
        );
        source.sets.insert(
            "2.0".into(),
            vec![tuple("CVE-Y", "zlib", None), tuple("CVE-Z", "curl", None)],
        );
        source.metrics.insert("CVE-Z".into(), metric("CVE-Z", 9.8, "CRITICAL"));

        let engine = ComparisonEngine::new(source);
        let result = engine.compare("team", "product", "app", "1.0", "2.0").unwrap();

        assert_eq!(result.stats.shared, 1);
        assert_eq!(result.stats.only_version_a, 1);
        assert_eq!(result.stats.only_version_b, 1);
        assert_eq!(result.stats.total(), result.rows.len());

        let shared: Vec<_> = result.rows_of(Classification::Shared).collect();
        assert_eq!(shared[0].cve_id, "CVE-Y");
        assert_eq!(result.stats.introduced.critical, 1);
        assert_eq!(result.stats.resolved.unknown, 1);

        let ids: Vec<_> = result.rows.iter().map(|r| r.cve_id.as_str()).collect();
        assert_eq!(ids, ["CVE-X", "CVE-Y", "CVE-Z"]);
    }

    #[test]
    fn test_one_row_per_key_with_paths() {
        let mut source = FakeSource::default();
        source.sets.insert(
            "1.0".into(),
            vec![
                tuple("CVE-1", "openssl", Some("/usr/lib/b.so")),
                tuple("CVE-1", "openssl", Some("/usr/lib/a.so")),
                tuple("CVE-1", "openssl", Some("/usr/lib/a.so")),
            ],
        );
        source.sets.insert("2.0".into(), vec![tuple("CVE-1", "openssl", None)]);

        let result = ComparisonEngine::new(source)
            .compare("t", "p", "app", "1.0", "2.0")
            .unwrap();

        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_eq!(row.classification, Classification::Shared);
        assert_eq!(row.paths_a, ["/usr/lib/a.so", "/usr/lib/b.so"]);
        assert!(row.paths_b.is_empty());
        assert!(row.cvss.is_none());
        assert_eq!(row.severity, Severity::Unknown);
    }

    #[test]
    fn test_ordering_cve_component_type() {
        let mut source = FakeSource::default();
        let mut os_pkg = tuple("CVE-1", "openssl", None);
        os_pkg.component_type = "os-pkg".into();
        source.sets.insert(
            "1.0".into(),
            vec![
                tuple("CVE-2", "aaa", None),
                tuple("CVE-1", "openssl", None),
                os_pkg,
                tuple("CVE-1", "curl", None),
            ],
        );

        let result = ComparisonEngine::new(source)
            .compare("t", "p", "app", "1.0", "2.0")
            .unwrap();

        let keys: Vec<_> = result
            .rows
            .iter()
            .map(|r| (r.cve_id.as_str(), r.component.as_str(), r.component_type.as_str()))
            .collect();
        assert_eq!(
            keys,
            [
                ("CVE-1", "curl", "library"),
                ("CVE-1", "openssl", "library"),
                ("CVE-1", "openssl", "os-pkg"),
                ("CVE-2", "aaa", "library"),
            ]
        );
        assert_eq!(result.stats.only_version_a, 4);
    }

    #[test]
    fn test_empty_versions() {
        let result = ComparisonEngine::new(FakeSource::default())
            .compare("t", "p", "app", "1.0", "2.0")
            .unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.stats, ComparisonStats::default());
    }

    fn binding(version: &str, cve: &str, component: &str) -> ImageVulnerability {
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
            affected_path: None,
        }
    }

    #[tokio::test]
    async fn test_compare_against_store() {
        let store = Store::in_memory().unwrap();
        store
            .upsert_image_vulnerabilities(vec![
                binding("1.0", "CVE-2024-0001", "openssl"),
                binding("1.0", "CVE-2024-0002", "zlib"),
                binding("2.0", "CVE-2024-0002", "zlib"),
                binding("2.0", "CVE-2024-0003", "curl"),
            ])
            .await
            .unwrap();
        store
            .upsert_cvss(vec![
                metric("CVE-2024-0002", 5.3, "MEDIUM"),
                CvssMetric {
                    source: "cna@example.com".into(),
                    ..metric("CVE-2024-0002", 8.1, "HIGH")
                },
            ])
            .await
            .unwrap();

        let result = ComparisonEngine::new(store)
            .compare("payments", "shop", "registry/app", "1.0", "2.0")
            .unwrap();

        assert_eq!(
            (result.stats.shared, result.stats.only_version_a, result.stats.only_version_b),
            (1, 1, 1)
        );
        let shared = result.rows_of(Classification::Shared).next().unwrap();
        let cvss = shared.cvss.as_ref().unwrap();
        assert_eq!(cvss.base_score, Some(8.1));
        assert_eq!(cvss.source, "cna@example.com");
        assert_eq!(shared.severity, Severity::High);
    }
}
