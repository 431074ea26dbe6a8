//! Table definitions

use crate::connection::sqlite_error;
use rusqlite::Connection;
use vulnsync_core::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    partition TEXT PRIMARY KEY,
    last_modified TEXT NOT NULL,
    checksum TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cves (
    id TEXT PRIMARY KEY,
    source_identifier TEXT,
    published TEXT,
    last_modified TEXT,
    vuln_status TEXT,
    refs TEXT NOT NULL DEFAULT '',
    descriptions TEXT,
    weaknesses TEXT,
    configurations TEXT
);

CREATE TABLE IF NOT EXISTS cvss_metrics (
    cve_id TEXT NOT NULL,
    source TEXT NOT NULL,
    cvss_version TEXT NOT NULL,
    vector_string TEXT,
    base_score REAL,
    base_severity TEXT,
    PRIMARY KEY (cve_id, source, cvss_version)
);

CREATE TABLE IF NOT EXISTS osv_records (
    id TEXT PRIMARY KEY,
    schema_version TEXT,
    modified TEXT NOT NULL,
    published TEXT,
    withdrawn TEXT,
    summary TEXT,
    details TEXT,
    database_specific TEXT
);

CREATE TABLE IF NOT EXISTS osv_aliases (
    osv_id TEXT NOT NULL,
    alias TEXT NOT NULL,
    PRIMARY KEY (osv_id, alias)
);

CREATE TABLE IF NOT EXISTS osv_references (
    osv_id TEXT NOT NULL,
    ref_type TEXT NOT NULL,
    url TEXT NOT NULL,
    PRIMARY KEY (osv_id, ref_type, url)
);

CREATE TABLE IF NOT EXISTS osv_severities (
    osv_id TEXT NOT NULL,
    severity_type TEXT NOT NULL,
    score TEXT NOT NULL,
    PRIMARY KEY (osv_id, severity_type)
);

CREATE TABLE IF NOT EXISTS osv_affected (
    osv_id TEXT NOT NULL,
    ecosystem TEXT NOT NULL,
    name TEXT NOT NULL,
    purl TEXT,
    ranges TEXT,
    versions TEXT,
    ecosystem_specific TEXT,
    database_specific TEXT,
    PRIMARY KEY (osv_id, ecosystem, name)
);

CREATE TABLE IF NOT EXISTS osv_credits (
    osv_id TEXT NOT NULL,
    name TEXT NOT NULL,
    contact TEXT,
    credit_type TEXT,
    PRIMARY KEY (osv_id, name)
);

CREATE TABLE IF NOT EXISTS image_vulnerabilities (
    scanner TEXT NOT NULL,
    image_name TEXT NOT NULL,
    image_version TEXT NOT NULL,
    product TEXT NOT NULL,
    team TEXT NOT NULL,
    cve_id TEXT NOT NULL,
    component_type TEXT NOT NULL,
    component TEXT NOT NULL,
    fix_versions TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    affected_version TEXT,
    affected_path TEXT,
    PRIMARY KEY (scanner, image_name, image_version, product, team, cve_id, component_type, component),
    CHECK (first_seen <= last_seen)
);

CREATE INDEX IF NOT EXISTS idx_image_vulns_version
    ON image_vulnerabilities(team, product, image_name, image_version);
CREATE INDEX IF NOT EXISTS idx_osv_aliases_alias ON osv_aliases(alias);
"#;

/// Create all tables and indexes that do not exist yet
pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| sqlite_error("Failed to initialize schema", e))
}
