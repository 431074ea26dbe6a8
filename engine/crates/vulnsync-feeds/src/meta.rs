//! NVD feed metadata (`.meta`) files

use chrono::{DateTime, Utc};
use vulnsync_core::{Error, Result};

/// Modification time and bundle checksum published next to each NVD bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvdMeta {
    pub last_modified: DateTime<Utc>,
    /// Lowercase hex sha256 of the uncompressed JSON
    pub sha256: String,
    pub size: Option<u64>,
    pub gz_size: Option<u64>,
}

impl NvdMeta {
    /// Parse a `key:value` metadata document
    ///
    /// `lastModifiedDate` and `sha256` are required; sizes are optional.
    pub fn parse(text: &str) -> Result<Self> {
        let mut last_modified = None;
        let mut sha256 = None;
        let mut size = None;
        let mut gz_size = None;

        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "lastModifiedDate" => {
                    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        Error::Parse(format!("Invalid lastModifiedDate {:?}: {}", value, e))
                    })?;
                    last_modified = Some(parsed.with_timezone(&Utc));
                }
                "sha256" => sha256 = Some(value.to_ascii_lowercase()),
                "size" => size = value.parse().ok(),
                "gzSize" => gz_size = value.parse().ok(),
                _ => {}
            }
        }

        Ok(Self {
            last_modified: last_modified
                .ok_or_else(|| Error::Parse(String::from("Metadata lacks lastModifiedDate")))?,
            sha256: sha256.ok_or_else(|| Error::Parse(String::from("Metadata lacks sha256")))?,
            size,
            gz_size,
        })
    }
}
