//! OSV change index (`modified_id.csv`)

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::warn;
use vulnsync_core::{Error, Result};

/// One row of the change index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Object path below the bucket, possibly `ecosystem/ID`
    pub id: String,
    pub modified: DateTime<Utc>,
}

impl ChangeEntry {
    /// Advisory id without any ecosystem prefix
    pub fn record_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// Parse an OSV or NVD style timestamp into an instant
///
/// Timestamps without an offset are taken as UTC.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Column positions of the two fields we read
struct Layout {
    id: usize,
    modified: usize,
}

impl Layout {
    fn from_header(header: &StringRecord) -> Result<Self> {
        let position = |name: &str| {
            header
                .iter()
                .position(|field| field.eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::Parse(format!("Change index lacks a {} column", name)))
        };
        Ok(Self {
            id: position("id")?,
            modified: position("modified")?,
        })
    }
}

/// Parse the change index
///
/// Accepts a header naming `id` and `modified` columns in any order, or the
/// headerless `modified,id` rows the OSV bucket publishes. Rows with an
/// unparsable timestamp are skipped.
pub fn parse_change_index(text: &str) -> Result<Vec<ChangeEntry>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let first = match records.next() {
        Some(record) => record.map_err(|e| Error::Parse(format!("Invalid change index: {}", e)))?,
        None => return Ok(Vec::new()),
    };

    let headerless = first.get(0).and_then(parse_instant).is_some();
    let layout = if headerless {
        Layout { modified: 0, id: 1 }
    } else {
        Layout::from_header(&first)?
    };

    let mut entries = Vec::new();
    let mut push = |record: &StringRecord| {
        let id = record.get(layout.id).unwrap_or_default();
        let modified = record.get(layout.modified).unwrap_or_default();
        if id.is_empty() {
            warn!(
                line = ?record.position().map(|p| p.line()),
                "Skipping change index row without id"
            );
            return;
        }
        match parse_instant(modified) {
            Some(modified) => entries.push(ChangeEntry {
                id: id.to_string(),
                modified,
            }),
            None => warn!(
                id = %id,
                modified = %modified,
                "Skipping change index row with bad timestamp"
            ),
        }
    };

    if headerless {
        push(&first);
    }
    for record in records {
        let record = record.map_err(|e| Error::Parse(format!("Invalid change index: {}", e)))?;
        push(&record);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_header_in_any_order() {
        let text = "modified,id\n2024-04-02T10:00:00Z,GHSA-1\n2024-04-01T09:00:00Z,GHSA-2\n";
        let entries = parse_change_index(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "GHSA-1");

        let text = "id,modified\nGHSA-3,2024-04-03T00:00:00Z\n";
        let entries = parse_change_index(text).unwrap();
        assert_eq!(entries[0].id, "GHSA-3");
        assert_eq!(
            entries[0].modified,
            Utc.with_ymd_and_hms(2024, 4, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_headerless_bucket_layout() {
        let text = "2024-04-02T10:00:00.123Z,PyPI/PYSEC-2024-1\n2024-04-01T00:00:00Z,npm/GHSA-xx\n";
        let entries = parse_change_index(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "PyPI/PYSEC-2024-1");
        assert_eq!(entries[0].record_id(), "PYSEC-2024-1");
        assert_eq!(entries[1].record_id(), "GHSA-xx");
    }

    #[test]
    fn test_bad_rows_skipped() {
        let text = "id,modified\nGHSA-1,not-a-date\nGHSA-2,2024-04-01T00:00:00\n,2024-04-01T00:00:00Z\n";
        let entries = parse_change_index(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "GHSA-2");
    }

    #[test]
    fn test_missing_columns() {
        assert!(parse_change_index("name,when\nx,y\n").is_err());
        assert!(parse_change_index("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_instant_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_instant("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_instant("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_instant("2024-01-02T03:04:05.000"), Some(expected));
        assert_eq!(parse_instant("garbage"), None);
    }
}
