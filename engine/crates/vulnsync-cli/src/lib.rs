//! vulnsync service facade
//!
//! `VulnService` is the surface the rest of the platform calls into: sync
//! state access, bulk upserts, exposure queries, comparisons and sync
//! triggers, all against one store.

use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use vulnsync_common::Config;
use vulnsync_core::{
    CancellationToken, CveRecord, CvssMetric, Error, ImageVulnTuple, ImageVulnerability, OsvRows,
    Partition, Result, SyncState,
};
use vulnsync_diff::{ComparisonEngine, ComparisonResult};
use vulnsync_feeds::{Feed, SyncMode, SyncOrchestrator, SyncReport};
use vulnsync_store::{ImageRef, Store, SyncStateStore, UpsertReport};

pub struct VulnService {
    config: Config,
    store: Store,
    syncs: SyncOrchestrator,
    cancel: CancellationToken,
}

impl VulnService {
    /// Open the configured database
    pub fn open(config: Config) -> Result<Self> {
        let store = Store::open(&config.database)?;
        Self::with_store(config, store)
    }

    /// Build the service around `store`; every sync trigger shares one
    /// orchestrator and with it one fetch rate limit
    pub fn with_store(config: Config, store: Store) -> Result<Self> {
        let cancel = CancellationToken::new();
        let store = store.with_cancellation(cancel.clone());
        let syncs = SyncOrchestrator::from_config(&config, store.clone())?
            .with_cancellation(cancel.clone());
        Ok(Self {
            config,
            store,
            syncs,
            cancel,
        })
    }

    /// Token that stops running syncs and upserts once cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // === Sync state ===

    pub fn sync_partitions(&self) -> Result<Vec<Partition>> {
        self.store.sync_partitions()
    }

    pub fn sync_state(&self, partition: Partition) -> Result<Option<SyncState>> {
        self.store.sync_state(partition)
    }

    pub fn put_sync_state(&self, state: &SyncState) -> Result<bool> {
        self.store.put_sync_state(state)
    }

    /// Stored state of every partition, in key order
    pub fn status(&self) -> Result<Vec<SyncState>> {
        let mut states = Vec::new();
        for partition in self.sync_partitions()? {
            if let Some(state) = self.sync_state(partition)? {
                states.push(state);
            }
        }
        Ok(states)
    }

    // === Bulk upserts ===

    pub async fn bulk_upsert_cves(&self, rows: Vec<CveRecord>) -> Result<UpsertReport> {
        self.store.upsert_cves(rows).await
    }

    pub async fn bulk_upsert_cvss(&self, rows: Vec<CvssMetric>) -> Result<UpsertReport> {
        self.store.upsert_cvss(rows).await
    }

    /// Upsert an OSV record set, parent rows first
    pub async fn bulk_upsert_osv(&self, rows: OsvRows) -> Result<Vec<UpsertReport>> {
        self.store.upsert_osv(rows).await
    }

    pub async fn bulk_upsert_image_vulnerabilities(
        &self,
        rows: Vec<ImageVulnerability>,
    ) -> Result<UpsertReport> {
        self.store.upsert_image_vulnerabilities(rows).await
    }

    /// Load scanner bindings from a JSON array file
    pub async fn import_bindings(&self, path: &Path) -> Result<UpsertReport> {
        let content = tokio::fs::read_to_string(path).await?;
        let rows: Vec<ImageVulnerability> = serde_json::from_str(&content).map_err(|e| {
            Error::Parse(format!("Invalid bindings file {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), rows = rows.len(), "Importing bindings");
        self.bulk_upsert_image_vulnerabilities(rows).await
    }

    // === Queries ===

    pub fn query_image_vuln_set(
        &self,
        team: &str,
        product: &str,
        image_name: &str,
        image_version: &str,
    ) -> Result<Vec<ImageVulnTuple>> {
        self.store
            .image_vuln_set(&ImageRef::new(team, product, image_name, image_version))
    }

    pub fn query_best_cvss(&self, cve_ids: &[String]) -> Result<HashMap<String, CvssMetric>> {
        self.store.best_cvss(cve_ids)
    }

    pub fn compare(
        &self,
        team: &str,
        product: &str,
        image_name: &str,
        version_a: &str,
        version_b: &str,
    ) -> Result<ComparisonResult> {
        let engine = ComparisonEngine::new(self.store.clone());
        engine.compare(team, product, image_name, version_a, version_b)
    }

    // === Sync ===

    /// Run one sync; `feed` is "nvd" or "osv", `mode` is "full" or "recent"
    ///
    /// A second trigger for a feed that is already syncing waits for the
    /// running one to finish.
    pub async fn run_sync(&self, feed: &str, mode: &str) -> Result<SyncReport> {
        let feed: Feed = feed.parse()?;
        let mode: SyncMode = mode.parse()?;
        self.syncs.run_sync(feed, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use vulnsync_common::ConfigBuilder;

    fn service() -> VulnService {
        VulnService::with_store(Config::default(), Store::in_memory().unwrap()).unwrap()
    }

    fn binding(version: &str, cve: &str) -> serde_json::Value {
        serde_json::json!({
            "scanner": "grype",
            "image_name": "registry/api",
            "image_version": version,
            "product": "portal",
            "team": "core",
            "cve_id": cve,
            "component_type": "os-package",
            "component": "libssl3",
            "fix_versions": "3.0.13",
            "first_seen": "2024-06-01T00:00:00Z",
            "last_seen": "2024-06-02T00:00:00Z",
            "affected_version": "3.0.11",
            "affected_path": null
        })
    }

    #[tokio::test]
    async fn test_run_sync_rejects_unknown_names() {
        let service = service();

        let err = service.run_sync("ghsa", "full").await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let err = service.run_sync("nvd", "weekly").await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_import_then_compare() {
        let service = service();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bindings.json");
        let doc = serde_json::Value::Array(vec![
            binding("1.0", "CVE-2024-0001"),
            binding("1.0", "CVE-2024-0002"),
            binding("1.1", "CVE-2024-0002"),
        ]);
        std::fs::write(&file, doc.to_string()).unwrap();

        let report = service.import_bindings(&file).await.unwrap();
        assert_eq!(report.committed, 3);

        let set = service
            .query_image_vuln_set("core", "portal", "registry/api", "1.0")
            .unwrap();
        assert_eq!(set.len(), 2);

        let result = service
            .compare("core", "portal", "registry/api", "1.0", "1.1")
            .unwrap();
        assert_eq!(result.stats.shared, 1);
        assert_eq!(result.stats.only_version_a, 1);
        assert_eq!(result.stats.only_version_b, 0);
    }

    #[tokio::test]
    async fn test_import_rejects_bad_file() {
        let service = service();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bindings.json");
        std::fs::write(&file, "{\"not\": \"an array\"}").unwrap();

        let err = service.import_bindings(&file).await.unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_concurrent_syncs_of_one_feed_take_turns() {
        if std::net::TcpListener::bind("127.0.0.1:0").is_err() {
            eprintln!("Skipping test: cannot bind to localhost in this environment");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/osv/modified_id.csv");
                then.status(200).body("2024-04-02T10:00:00Z,npm/GHSA-1\n");
            })
            .await;
        let object = server
            .mock_async(|when, then| {
                when.method(GET).path("/osv/npm/GHSA-1.json");
                then.status(200).json_body(serde_json::json!({
                    "id": "GHSA-1",
                    "modified": "2024-04-02T10:00:00Z"
                }));
            })
            .await;

        let work = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new()
            .osv_bucket_url(server.url("/osv"))
            .work_dir(work.path())
            .build();
        let service = VulnService::with_store(config, Store::in_memory().unwrap()).unwrap();

        let (first, second) = tokio::join!(
            service.run_sync("osv", "recent"),
            service.run_sync("osv", "recent")
        );
        let needed: Vec<usize> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .map(|report| match report {
                SyncReport::Osv(stats) => stats.updates_needed,
                other => panic!("unexpected report: {:?}", other),
            })
            .collect();

        // Whichever ran second found the record already stored.
        assert_eq!(needed.iter().sum::<usize>(), 1);
        object.assert_hits_async(1).await;
        assert!(!work.path().join("osv").exists());
    }

    #[test]
    fn test_status_lists_states() {
        let service = service();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        service
            .put_sync_state(&SyncState::new(Partition::Recent, at, "abc"))
            .unwrap();
        service
            .put_sync_state(&SyncState::new(Partition::Year(2023), at, "def"))
            .unwrap();

        let states = service.status().unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().any(|s| s.partition == Partition::Recent));
    }
}
