//! NVD CVE JSON 2.0 normalization

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::BufRead;
use vulnsync_core::{CveRecord, CvssMetric, Error, NvdRows, Result};

const METRIC_KEY_PREFIX: &str = "cvssMetricV";

// NVD JSON feed structures

#[derive(Debug, Deserialize)]
struct NvdFeed {
    vulnerabilities: Vec<NvdCve>,
}

/// One feed entry, either `{"cve": {...}}` or the CVE fields themselves
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCve {
    cve: Option<Box<NvdCve>>,
    id: Option<String>,
    source_identifier: Option<String>,
    published: Option<String>,
    last_modified: Option<String>,
    vuln_status: Option<String>,
    #[serde(default)]
    references: Vec<NvdReference>,
    #[serde(default)]
    descriptions: Value,
    #[serde(default)]
    weaknesses: Value,
    #[serde(default)]
    configurations: Value,
    #[serde(default)]
    metrics: BTreeMap<String, Vec<NvdMetric>>,
}

impl NvdCve {
    fn unwrap_entry(mut self) -> NvdCve {
        match self.cve.take() {
            Some(inner) => *inner,
            None => self,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NvdReference {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetric {
    source: Option<String>,
    cvss_data: Option<CvssData>,
    base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssData {
    version: Option<String>,
    vector_string: Option<String>,
    base_score: Option<f64>,
    base_severity: Option<String>,
}

/// CVSS version implied by a metrics key: `cvssMetricV31` is 3.1, `cvssMetricV2` is 2.0
pub fn version_from_metric_key(key: &str) -> Option<String> {
    let digits = key.strip_prefix(METRIC_KEY_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (major, minor) = digits.split_at(1);
    Some(format!("{}.{}", major, if minor.is_empty() { "0" } else { minor }))
}

/// Parse an NVD feed document held in memory
pub fn parse_nvd_feed(text: &str) -> Result<NvdRows> {
    parse_nvd_reader(text.as_bytes())
}

/// Parse an NVD feed document, or a bare array of its entries, from a reader
pub fn parse_nvd_reader<R: BufRead>(mut reader: R) -> Result<NvdRows> {
    let entries = if starts_with_array(&mut reader)? {
        serde_json::from_reader::<_, Vec<NvdCve>>(reader)
    } else {
        serde_json::from_reader::<_, NvdFeed>(reader).map(|feed| feed.vulnerabilities)
    }
    .map_err(|e| Error::Parse(format!("Failed to parse NVD feed: {}", e)))?;
    normalize(entries)
}

/// Skip leading whitespace and report whether the document is a JSON array
fn starts_with_array<R: BufRead>(reader: &mut R) -> Result<bool> {
    loop {
        let (skip, first) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(false);
            }
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(at) => (at, Some(buf[at])),
                None => (buf.len(), None),
            }
        };
        reader.consume(skip);
        if let Some(first) = first {
            return Ok(first == b'[');
        }
    }
}

fn normalize(entries: Vec<NvdCve>) -> Result<NvdRows> {
    let mut rows = NvdRows::default();
    for (index, entry) in entries.into_iter().enumerate() {
        let cve = entry.unwrap_entry();
        let id = cve
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Parse(format!("NVD entry {} has no id", index)))?;

        for (key, metrics) in &cve.metrics {
            for metric in metrics {
                rows.cvss.push(cvss_row(&id, &cve, key, metric));
            }
        }

        let references = cve
            .references
            .iter()
            .filter_map(|r| r.url.as_deref())
            .filter(|url| !url.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        rows.cves.push(CveRecord {
            id,
            source_identifier: cve.source_identifier,
            published: cve.published,
            last_modified: cve.last_modified,
            vuln_status: cve.vuln_status,
            references,
            descriptions: cve.descriptions,
            weaknesses: cve.weaknesses,
            configurations: cve.configurations,
        });
    }

    Ok(rows)
}

fn cvss_row(id: &str, cve: &NvdCve, key: &str, metric: &NvdMetric) -> CvssMetric {
    let data = metric.cvss_data.as_ref();
    let cvss_version = data
        .and_then(|d| d.version.clone())
        .or_else(|| version_from_metric_key(key))
        .unwrap_or_else(|| key.to_string());
    let source = metric
        .source
        .clone()
        .or_else(|| cve.source_identifier.clone())
        .unwrap_or_else(|| String::from("unknown"));

    CvssMetric {
        cve_id: id.to_string(),
        source,
        cvss_version,
        vector_string: data.and_then(|d| d.vector_string.clone()),
        base_score: data.and_then(|d| d.base_score),
        // v3+ carries severity inside cvssData, v2 next to it
        base_severity: data
            .and_then(|d| d.base_severity.clone())
            .or_else(|| metric.base_severity.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "resultsPerPage": 2,
            "format": "NVD_CVE",
            "version": "2.0",
            "vulnerabilities": [
                {
                    "cve": {
                        "id": "CVE-2023-1234",
                        "sourceIdentifier": "cna@example.com",
                        "published": "2023-03-01T10:15:00.000",
                        "lastModified": "2023-03-08T12:00:00.000",
                        "vulnStatus": "Analyzed",
                        "descriptions": [{"lang": "en", "value": "Heap overflow"}],
                        "references": [
                            {"url": "https://example.com/a", "source": "cna@example.com"},
                            {"url": "https://example.com/b"}
                        ],
                        "metrics": {
                            "cvssMetricV31": [{
                                "source": "nvd@nist.gov",
                                "type": "Primary",
                                "cvssData": {
                                    "version": "3.1",
                                    "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:N/A:N",
                                    "baseScore": 7.5,
                                    "baseSeverity": "HIGH"
                                }
                            }]
                        },
                        "weaknesses": [{
                            "source": "nvd@nist.gov",
                            "description": [{"lang": "en", "value": "CWE-787"}]
                        }],
                        "configurations": []
                    }
                },
                {
                    "cve": {
                        "id": "CVE-2010-0001",
                        "vulnStatus": "Modified",
                        "metrics": {
                            "cvssMetricV2": [{
                                "source": "nvd@nist.gov",
                                "cvssData": {
                                    "vectorString": "AV:N/AC:L/Au:N/C:P/I:P/A:P",
                                    "baseScore": 7.5
                                },
                                "baseSeverity": "HIGH"
                            }]
                        }
                    }
                }
            ]
        })
    }

    #[test]
    fn test_parse_analyzed_cve_with_v31_metric() {
        let rows = parse_nvd_feed(&sample().to_string()).unwrap();

        let cve = rows.cves.iter().find(|c| c.id == "CVE-2023-1234").unwrap();
        assert_eq!(cve.vuln_status.as_deref(), Some("Analyzed"));
        assert_eq!(cve.references, "https://example.com/a\nhttps://example.com/b");
        assert_eq!(cve.descriptions[0]["value"], "Heap overflow");

        let cvss: Vec<_> = rows.cvss.iter().filter(|m| m.cve_id == "CVE-2023-1234").collect();
        assert_eq!(cvss.len(), 1);
        assert_eq!(cvss[0].base_score, Some(7.5));
        assert_eq!(cvss[0].cvss_version, "3.1");
        assert_eq!(cvss[0].base_severity.as_deref(), Some("HIGH"));
    }

    #[test]
    fn test_v2_metric_version_and_sibling_severity() {
        let rows = parse_nvd_feed(&sample().to_string()).unwrap();
        let v2 = rows.cvss.iter().find(|m| m.cve_id == "CVE-2010-0001").unwrap();

        assert_eq!(v2.cvss_version, "2.0");
        assert_eq!(v2.base_severity.as_deref(), Some("HIGH"));
        let cve = rows.cves.iter().find(|c| c.id == "CVE-2010-0001").unwrap();
        assert_eq!(cve.references, "");
        assert_eq!(cve.configurations, Value::Null);
    }

    #[test]
    fn test_bare_array_is_accepted() {
        let bare = sample()["vulnerabilities"].clone();
        let rows = parse_nvd_reader(bare.to_string().as_bytes()).unwrap();
        assert_eq!(rows.cves.len(), 2);
        assert_eq!(rows.cvss.len(), 2);
    }

    #[test]
    fn test_flat_entries_after_whitespace() {
        let doc = format!(
            "\n  {}",
            json!([
                {"id": "CVE-2024-0001", "vulnStatus": "Received"},
                {"cve": {"id": "CVE-2024-0002"}}
            ])
        );
        let rows = parse_nvd_reader(doc.as_bytes()).unwrap();
        let ids: Vec<&str> = rows.cves.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["CVE-2024-0001", "CVE-2024-0002"]);
        assert_eq!(rows.cves[0].vuln_status.as_deref(), Some("Received"));
    }

    #[test]
    fn test_document_without_entries_is_rejected() {
        assert_eq!(parse_nvd_feed("{\"format\": \"NVD_CVE\"}").unwrap_err().code(), "PARSE_ERROR");
        assert_eq!(parse_nvd_feed("").unwrap_err().code(), "PARSE_ERROR");
    }

    #[test]
    fn test_entry_without_id_fails_whole_file() {
        let doc = json!({"vulnerabilities": [
            {"cve": {"id": "CVE-2024-0001"}},
            {"cve": {"vulnStatus": "Received"}}
        ]});
        let err = parse_nvd_feed(&doc.to_string()).unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");

        assert!(parse_nvd_feed("{not json").is_err());
    }

    #[test]
    fn test_version_from_metric_key() {
        assert_eq!(version_from_metric_key("cvssMetricV31").as_deref(), Some("3.1"));
        assert_eq!(version_from_metric_key("cvssMetricV40").as_deref(), Some("4.0"));
        assert_eq!(version_from_metric_key("cvssMetricV2").as_deref(), Some("2.0"));
        assert_eq!(version_from_metric_key("cvssMetric"), None);
        assert_eq!(version_from_metric_key("other"), None);
    }
}
