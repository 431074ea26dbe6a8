//! Image vulnerability bindings recorded by container scanners

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A vulnerability observed in one version of a scanned image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageVulnerability {
    pub scanner: String,
    pub image_name: String,
    pub image_version: String,
    pub product: String,
    pub team: String,
    pub cve_id: String,
    /// Kind of affected component ("os-package", "library", ...)
    pub component_type: String,
    pub component: String,
    pub fix_versions: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub affected_version: Option<String>,
    pub affected_path: Option<String>,
}

impl ImageVulnerability {
    /// Natural key rendered for logs and errors
    pub fn key(&self) -> String {
        format!(
            "{}/{}:{}/{}/{}/{}/{}/{}",
            self.scanner,
            self.image_name,
            self.image_version,
            self.product,
            self.team,
            self.cve_id,
            self.component_type,
            self.component
        )
    }

    /// Enforce `first_seen <= last_seen`
    pub fn validate(&self) -> Result<()> {
        if self.first_seen > self.last_seen {
            return Err(Error::InvalidRecord {
                record_id: self.key(),
                message: format!(
                    "first_seen {} is after last_seen {}",
                    self.first_seen, self.last_seen
                ),
            });
        }
        Ok(())
    }
}

/// One distinct exposure tuple of an image version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageVulnTuple {
    pub cve_id: String,
    pub component_type: String,
    pub component: String,
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn binding(first: i64, last: i64) -> ImageVulnerability {
        ImageVulnerability {
            scanner: "trivy".into(),
            image_name: "registry/app".into(),
            image_version: "1.0.0".into(),
            product: "shop".into(),
            team: "payments".into(),
            cve_id: "CVE-2024-0001".into(),
            component_type: "library".into(),
            component: "openssl".into(),
            fix_versions: None,
            first_seen: Utc.timestamp_opt(first, 0).unwrap(),
            last_seen: Utc.timestamp_opt(last, 0).unwrap(),
            affected_version: None,
            affected_path: None,
        }
    }

    #[test]
    fn test_validate_seen_order() {
        assert!(binding(10, 10).validate().is_ok());
        assert!(binding(10, 20).validate().is_ok());

        let err = binding(20, 10).validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_RECORD");
    }
}
