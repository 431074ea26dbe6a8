//! OSV advisory normalization

use serde::Deserialize;
use serde_json::Value;
use tracing::error;
use vulnsync_core::{
    Error, OsvAffected, OsvAlias, OsvCredit, OsvRecord, OsvReference, OsvRows, OsvSeverity, Result,
};

/// Reference type assumed when an entry has none
pub const DEFAULT_REFERENCE_TYPE: &str = "WEB";

#[derive(Debug, Deserialize)]
struct OsvVuln {
    id: Option<String>,
    modified: Option<String>,
    schema_version: Option<String>,
    published: Option<String>,
    withdrawn: Option<String>,
    summary: Option<String>,
    details: Option<String>,
    database_specific: Option<Value>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    references: Vec<OsvVulnReference>,
    #[serde(default)]
    severity: Vec<OsvVulnSeverity>,
    #[serde(default)]
    affected: Vec<OsvVulnAffected>,
    #[serde(default)]
    credits: Vec<OsvVulnCredit>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnReference {
    #[serde(rename = "type")]
    ref_type: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnSeverity {
    #[serde(rename = "type")]
    severity_type: Option<String>,
    score: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnAffected {
    package: Option<OsvPackage>,
    ranges: Option<Value>,
    versions: Option<Value>,
    ecosystem_specific: Option<Value>,
    database_specific: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OsvPackage {
    ecosystem: Option<String>,
    name: Option<String>,
    purl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnCredit {
    name: Option<String>,
    contact: Option<Value>,
    #[serde(rename = "type")]
    credit_type: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Parse one OSV JSON document
///
/// Malformed JSON is an error. A document without `id` or `modified` is
/// rejected whole: the result is empty and the rejection is logged.
pub fn parse_osv(text: &str) -> Result<OsvRows> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Parse(format!("Failed to parse OSV object: {}", e)))?;
    parse_osv_value(value)
}

pub fn parse_osv_value(value: Value) -> Result<OsvRows> {
    let vuln: OsvVuln = serde_json::from_value(value)
        .map_err(|e| Error::Parse(format!("Unexpected OSV object shape: {}", e)))?;

    let (id, modified) = match (present(&vuln.id), present(&vuln.modified)) {
        (Some(id), Some(modified)) => (id.to_string(), modified.to_string()),
        _ => {
            error!(
                id = vuln.id.as_deref().unwrap_or("<missing>"),
                "Rejecting OSV object without id or modified"
            );
            return Ok(OsvRows::default());
        }
    };

    let mut rows = OsvRows::default();

    rows.aliases = vuln
        .aliases
        .into_iter()
        .map(|alias| OsvAlias {
            osv_id: id.clone(),
            alias,
        })
        .collect();

    rows.references = vuln
        .references
        .into_iter()
        .filter_map(|r| {
            let url = r.url.filter(|u| !u.trim().is_empty())?;
            Some(OsvReference {
                osv_id: id.clone(),
                ref_type: r
                    .ref_type
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| String::from(DEFAULT_REFERENCE_TYPE)),
                url,
            })
        })
        .collect();

    rows.severities = vuln
        .severity
        .into_iter()
        .filter_map(|s| {
            Some(OsvSeverity {
                osv_id: id.clone(),
                severity_type: s.severity_type.filter(|t| !t.is_empty())?,
                score: s.score.filter(|t| !t.is_empty())?,
            })
        })
        .collect();

    rows.affected = vuln
        .affected
        .into_iter()
        .filter_map(|a| {
            let package = a.package?;
            Some(OsvAffected {
                osv_id: id.clone(),
                ecosystem: package.ecosystem.filter(|e| !e.is_empty())?,
                name: package.name.filter(|n| !n.is_empty())?,
                purl: package.purl,
                ranges: a.ranges,
                versions: a.versions,
                ecosystem_specific: a.ecosystem_specific,
                database_specific: a.database_specific,
            })
        })
        .collect();

    rows.credits = vuln
        .credits
        .into_iter()
        .filter_map(|c| {
            Some(OsvCredit {
                osv_id: id.clone(),
                name: c.name.filter(|n| !n.trim().is_empty())?,
                contact: c.contact,
                credit_type: c.credit_type,
            })
        })
        .collect();

    rows.records.push(OsvRecord {
        id,
        schema_version: vuln.schema_version,
        modified,
        published: vuln.published,
        withdrawn: vuln.withdrawn,
        summary: vuln.summary,
        details: vuln.details,
        database_specific: vuln.database_specific,
    });

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn advisory() -> Value {
        json!({
            "schema_version": "1.6.0",
            "id": "GHSA-abcd-1234-wxyz",
            "modified": "2024-04-02T10:00:00Z",
            "published": "2024-03-01T00:00:00Z",
            "summary": "Prototype pollution",
            "aliases": ["CVE-2024-1111"],
            "references": [
                {"type": "ADVISORY", "url": "https://github.com/advisories/GHSA-abcd"},
                {"url": "https://example.com/writeup"},
                {"type": "WEB", "url": ""}
            ],
            "severity": [
                {"type": "CVSS_V3", "score": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H"},
                {"type": "CVSS_V4"}
            ],
            "affected": [
                {
                    "package": {"ecosystem": "npm", "name": "lodash", "purl": "pkg:npm/lodash"},
                    "ranges": [{
                        "type": "SEMVER",
                        "events": [{"introduced": "0"}, {"fixed": "4.17.21"}]
                    }],
                    "versions": ["4.17.20"],
                    "database_specific": {"source": "ghsa"}
                },
                {"package": {"ecosystem": "npm"}}
            ],
            "credits": [
                {"name": "Researcher", "contact": ["https://example.com/r"], "type": "FINDER"},
                {"contact": ["anon"]}
            ],
            "database_specific": {"severity": "HIGH"}
        })
    }

    #[test]
    fn test_parse_full_advisory() {
        let rows = parse_osv_value(advisory()).unwrap();

        assert_eq!(rows.records.len(), 1);
        let record = &rows.records[0];
        assert_eq!(record.schema_version.as_deref(), Some("1.6.0"));
        assert_eq!(record.database_specific, Some(json!({"severity": "HIGH"})));
        assert!(record.withdrawn.is_none());

        assert_eq!(rows.aliases.len(), 1);
        assert_eq!(rows.aliases[0].alias, "CVE-2024-1111");

        assert_eq!(rows.references.len(), 2);
        assert_eq!(rows.references[1].ref_type, DEFAULT_REFERENCE_TYPE);

        assert_eq!(rows.severities.len(), 1);
        assert_eq!(rows.affected.len(), 1);
        assert_eq!(rows.affected[0].purl.as_deref(), Some("pkg:npm/lodash"));
        assert_eq!(rows.affected[0].versions, Some(json!(["4.17.20"])));

        assert_eq!(rows.credits.len(), 1);
        assert_eq!(rows.credits[0].credit_type.as_deref(), Some("FINDER"));
    }

    #[test]
    fn test_missing_modified_rejects_everything() {
        let mut value = advisory();
        value.as_object_mut().unwrap().remove("modified");

        let rows = parse_osv_value(value).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_missing_id_rejects_everything() {
        let rows =
            parse_osv(r#"{"modified": "2024-01-01T00:00:00Z", "aliases": ["CVE-1"]}"#).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        let err = parse_osv("{\"id\": ").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }
}
